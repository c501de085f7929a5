use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::RequestContext;

// Tokens are issued by the surrounding auth system, which shares this secret.
static JWT_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-in-production".to_string())
});

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub group_id: Uuid,
    pub exp: usize,
}

#[derive(Debug)]
pub enum AuthError {
    Missing,
    Invalid,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestContext {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        // Authorization: Bearer <token>
        let auth_header = request.headers().get_one("Authorization");

        match auth_header {
            Some(header) => {
                if let Some(token) = header.strip_prefix("Bearer ") {
                    match validate_token(token) {
                        Ok(claims) => Outcome::Success(RequestContext {
                            requester_id: claims.user_id,
                            group_id: claims.group_id,
                        }),
                        Err(e) => {
                            tracing::debug!(error = %e, "rejected bearer token");
                            Outcome::Error((Status::Unauthorized, AuthError::Invalid))
                        }
                    }
                } else {
                    Outcome::Error((Status::Unauthorized, AuthError::Invalid))
                }
            }
            None => Outcome::Error((Status::Unauthorized, AuthError::Missing)),
        }
    }
}

pub fn generate_token(user_id: Uuid, group_id: Uuid) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        user_id,
        group_id,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
}

pub fn validate_token(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(JWT_SECRET.as_bytes()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_session() {
        let user = Uuid::new_v4();
        let group = Uuid::new_v4();
        let token = generate_token(user, group).unwrap();
        let claims = validate_token(&token).unwrap();
        assert_eq!(claims.user_id, user);
        assert_eq!(claims.group_id, group);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = generate_token(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(validate_token(&tampered).is_err());
        assert!(validate_token("not-a-token").is_err());
    }
}
