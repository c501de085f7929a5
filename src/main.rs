#[macro_use]
extern crate rocket;

mod auth;
mod balance;
mod clock;
mod config;
mod db;
mod directory;
mod error;
mod expense;
mod ledger;
mod models;
mod money;
mod ocr;
mod routes;
mod service;
mod split;
mod store;

use std::sync::Arc;

use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedHeaders, AllowedOrigins, CorsOptions};
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::AppConfig;
use crate::directory::{ParticipantDirectory, StaticDirectory};
use crate::ocr::{DisabledScanner, HttpTicketScanner, TicketScanner};
use crate::routes::TicketIntake;
use crate::service::LedgerService;
use crate::store::{MemoryStore, SettlementStore};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn cors() -> rocket_cors::Cors {
    CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Delete, Method::Options]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allowed_headers(AllowedHeaders::all())
        .to_cors()
        .expect("CORS configuration failed")
}

/// Everything except the ledger service, which depends on the storage backend.
pub(crate) fn server(tickets: TicketIntake) -> Rocket<Build> {
    rocket::build()
        .attach(cors())
        .manage(tickets)
        .mount("/api", routes::get_routes())
        .register("/api", routes::get_catchers())
}

fn ticket_intake(config: &AppConfig) -> TicketIntake {
    let scanner: Box<dyn TicketScanner> = match &config.ocr_url {
        Some(url) => match HttpTicketScanner::new(url.clone(), config.currency) {
            Ok(scanner) => Box::new(scanner),
            Err(e) => {
                tracing::error!(error = %e, "could not set up OCR client, ticket scanning disabled");
                Box::new(DisabledScanner)
            }
        },
        None => Box::new(DisabledScanner),
    };
    TicketIntake {
        scanner,
        max_bytes: config.ocr_max_bytes,
    }
}

async fn ledger_service(config: &AppConfig) -> Result<LedgerService, String> {
    let (store, directory): (Arc<dyn SettlementStore>, Arc<dyn ParticipantDirectory>) =
        match &config.database_url {
            Some(database_url) => {
                db::run_migrations(database_url)
                    .await
                    .map_err(|e| format!("failed to run migrations: {e}"))?;
                let pool = db::init_pool(database_url)
                    .await
                    .map_err(|e| format!("failed to initialize database pool: {e}"))?;
                (
                    Arc::new(db::PgSettlementStore::new(pool.clone())),
                    Arc::new(db::PgDirectory::new(pool)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, keeping the ledger in memory");
                (Arc::new(MemoryStore::new()), Arc::new(StaticDirectory::new()))
            }
        };

    Ok(LedgerService::new(
        store,
        directory,
        Arc::new(SystemClock::new()),
        config.currency,
        config.write_retries,
    ))
}

#[launch]
fn rocket() -> _ {
    // Load .env file if it exists
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env().expect("invalid configuration");
    tracing::info!(
        currency = %config.currency,
        write_retries = config.write_retries,
        persistent = config.database_url.is_some(),
        "starting ledger"
    );

    server(ticket_intake(&config)).attach(AdHoc::try_on_ignite(
        "Initialize Ledger",
        move |rocket| async move {
            match ledger_service(&config).await {
                Ok(service) => Ok(rocket.manage(service)),
                Err(message) => {
                    tracing::error!(%message, "ledger startup failed");
                    Err(rocket)
                }
            }
        },
    ))
}
