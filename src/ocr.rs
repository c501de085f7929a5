//! Client for the external receipt-recognition service.
//!
//! The service receives the ticket image as base64 JSON and answers with line items.
//! Amounts come back as decimals (numbers or strings) and are turned into `Money`
//! here; nothing from this module is trusted by the ledger without going through
//! `createExpense` like any other input.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MoneyError;
use crate::money::{self, Currency, Money};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketItem {
    pub label: String,
    pub amount: Money,
}

#[derive(Debug, Error)]
pub enum TicketScanError {
    #[error("ticket scanning is not configured")]
    NotConfigured,

    #[error("ticket image is larger than {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("ticket image is empty")]
    Empty,

    #[error("OCR service unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR service answered with status {status}")]
    Rejected { status: u16 },

    #[error("OCR service returned an unusable amount: {0}")]
    InvalidAmount(String),

    #[error(transparent)]
    Money(#[from] MoneyError),
}

#[rocket::async_trait]
pub trait TicketScanner: Send + Sync {
    async fn scan(&self, image: &[u8], content_type: &str) -> Result<Vec<TicketItem>, TicketScanError>;
}

/// Scanner used when no OCR service is configured.
pub struct DisabledScanner;

#[rocket::async_trait]
impl TicketScanner for DisabledScanner {
    async fn scan(&self, _image: &[u8], _content_type: &str) -> Result<Vec<TicketItem>, TicketScanError> {
        Err(TicketScanError::NotConfigured)
    }
}

#[derive(Debug, Serialize)]
struct ScanRequest<'a> {
    image: String,
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(alias = "name", alias = "description")]
    label: String,
    #[serde(alias = "price")]
    amount: RawAmount,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(serde_json::Number),
    Text(String),
}

impl RawAmount {
    fn to_decimal(&self) -> Result<BigDecimal, TicketScanError> {
        let text = match self {
            RawAmount::Number(n) => n.to_string(),
            RawAmount::Text(s) => s.trim().trim_start_matches('$').replace(',', ""),
        };
        money::parse_decimal(&text).map_err(|_| TicketScanError::InvalidAmount(text))
    }
}

pub struct HttpTicketScanner {
    client: reqwest::Client,
    url: String,
    currency: Currency,
}

impl HttpTicketScanner {
    pub fn new(url: String, currency: Currency) -> Result<Self, TicketScanError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpTicketScanner {
            client,
            url,
            currency,
        })
    }
}

#[rocket::async_trait]
impl TicketScanner for HttpTicketScanner {
    async fn scan(&self, image: &[u8], content_type: &str) -> Result<Vec<TicketItem>, TicketScanError> {
        if image.is_empty() {
            return Err(TicketScanError::Empty);
        }
        let body = ScanRequest {
            image: STANDARD.encode(image),
            content_type,
        };
        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "OCR service rejected ticket");
            return Err(TicketScanError::Rejected {
                status: status.as_u16(),
            });
        }
        let parsed: ScanResponse = response.json().await?;
        let items = convert_items(parsed.items, self.currency)?;
        tracing::info!(items = items.len(), "ticket scanned");
        Ok(items)
    }
}

fn convert_items(raw: Vec<RawItem>, currency: Currency) -> Result<Vec<TicketItem>, TicketScanError> {
    raw.into_iter()
        .map(|item| {
            let amount = Money::from_decimal_rounded(&item.amount.to_decimal()?, currency)?;
            if amount.is_negative() {
                return Err(TicketScanError::InvalidAmount(amount.to_string()));
            }
            Ok(TicketItem {
                label: item.label.trim().to_string(),
                amount,
            })
        })
        .collect()
}

pub fn ticket_total(items: &[TicketItem], currency: Currency) -> Result<Money, MoneyError> {
    Money::sum(currency, items.iter().map(|item| item.amount))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mxn() -> Currency {
        "MXN".parse().unwrap()
    }

    #[test]
    fn converts_numbers_and_strings() {
        let parsed: ScanResponse = serde_json::from_str(
            r#"{"items": [
                {"label": "Tacos", "amount": 120.5},
                {"name": " Refresco ", "price": "$1,025.999"}
            ]}"#,
        )
        .unwrap();
        let items = convert_items(parsed.items, mxn()).unwrap();
        assert_eq!(items[0].amount.minor(), 12050);
        assert_eq!(items[1].label, "Refresco");
        assert_eq!(items[1].amount.minor(), 102600);
        assert_eq!(ticket_total(&items, mxn()).unwrap().minor(), 114650);
    }

    #[test]
    fn rejects_garbage_amounts() {
        let parsed: ScanResponse =
            serde_json::from_str(r#"{"items": [{"label": "?", "amount": "n/a"}]}"#).unwrap();
        assert!(matches!(
            convert_items(parsed.items, mxn()),
            Err(TicketScanError::InvalidAmount(_))
        ));

        let parsed: ScanResponse =
            serde_json::from_str(r#"{"items": [{"label": "refund", "amount": -3}]}"#).unwrap();
        assert!(convert_items(parsed.items, mxn()).is_err());
    }

    #[test]
    fn exponent_amounts_are_rejected() {
        for body in [
            r#"{"items": [{"label": "x", "amount": "1e30000000"}]}"#,
            r#"{"items": [{"label": "x", "amount": "1e9223372036854775807"}]}"#,
            r#"{"items": [{"label": "x", "amount": 1e300}]}"#,
        ] {
            let parsed: ScanResponse = serde_json::from_str(body).unwrap();
            assert!(matches!(
                convert_items(parsed.items, mxn()),
                Err(TicketScanError::InvalidAmount(_))
            ));
        }
    }

    #[test]
    fn missing_items_means_empty_ticket() {
        let parsed: ScanResponse = serde_json::from_str("{}").unwrap();
        assert!(convert_items(parsed.items, mxn()).unwrap().is_empty());
    }
}
