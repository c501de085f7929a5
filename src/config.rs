use thiserror::Error;

use crate::money::Currency;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Runtime settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string. Without one the ledger lives in memory.
    pub database_url: Option<String>,
    pub currency: Currency,
    /// How often a write that lost an optimistic-concurrency race is retried.
    pub write_retries: u32,
    pub ocr_url: Option<String>,
    pub ocr_max_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_url: None,
            currency: Currency::MXN,
            write_retries: 3,
            ocr_url: None,
            ocr_max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.database_url = value("DATABASE_URL");
        config.ocr_url = value("OCR_URL");

        if let Some(code) = value("LEDGER_CURRENCY") {
            config.currency = code.parse().map_err(|_| ConfigError::Invalid {
                key: "LEDGER_CURRENCY",
                message: format!("{code:?} is not an ISO 4217 code"),
            })?;
        }
        if let Some(retries) = value("LEDGER_WRITE_RETRIES") {
            config.write_retries = retries.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "LEDGER_WRITE_RETRIES",
                message: format!("{e}"),
            })?;
        }
        if let Some(bytes) = value("OCR_MAX_BYTES") {
            config.ocr_max_bytes = bytes.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "OCR_MAX_BYTES",
                message: format!("{e}"),
            })?;
        }
        Ok(config)
    }
}
