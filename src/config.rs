//! Process configuration, resolved once at startup and injected everywhere.
//!
//! Missing required values surface as [`ConfigError::Missing`]; they are
//! startup-class failures, never per-request ones.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::limits::AdmissionPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required configuration missing: {0}")]
    Missing(&'static str),
    #[error("invalid configuration value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Storage backend, selected at construction time. Both implementations
/// carry identical atomicity contracts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite { path: PathBuf },
    StateFile { path: PathBuf },
}

#[derive(Clone)]
pub struct MeterConfig {
    /// HMAC secret for proof-of-work challenge tokens.
    pub pow_secret: Vec<u8>,
    pub pow_difficulty: u32,
    pub pow_ttl_ms: i64,
    /// Shared secret expected on webhook deliveries.
    pub webhook_secret: Option<String>,
    /// Operator token for the admin override paths.
    pub admin_token: Option<String>,
    /// The deposit address payments must arrive at.
    pub pay_address: String,
    /// Chain the deposit address lives on.
    pub chain: String,
    /// Mint/contract id -> asset symbol. Transfers in other assets are
    /// ignored at ingestion.
    pub mint_allowlist: BTreeMap<String, String>,
    pub credits_per_unit: i64,
    pub min_topup_units: f64,
    pub match_window_ms: i64,
    pub admission: AdmissionPolicy,
    pub backend: StoreBackend,
}

impl std::fmt::Debug for MeterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterConfig")
            .field("pow_secret", &"<redacted>")
            .field("pow_difficulty", &self.pow_difficulty)
            .field("pow_ttl_ms", &self.pow_ttl_ms)
            .field("webhook_secret", &"<redacted>")
            .field("admin_token", &"<redacted>")
            .field("pay_address", &self.pay_address)
            .field("chain", &self.chain)
            .field("mint_allowlist", &self.mint_allowlist)
            .field("credits_per_unit", &self.credits_per_unit)
            .field("min_topup_units", &self.min_topup_units)
            .field("match_window_ms", &self.match_window_ms)
            .field("admission", &self.admission)
            .field("backend", &self.backend)
            .finish()
    }
}

impl MeterConfig {
    /// Minimal config with library defaults. Used directly by tests; the
    /// binary goes through [`MeterConfig::from_env`].
    pub fn new(
        pow_secret: impl Into<Vec<u8>>,
        pay_address: impl Into<String>,
        backend: StoreBackend,
    ) -> Self {
        Self {
            pow_secret: pow_secret.into(),
            pow_difficulty: 4,
            pow_ttl_ms: 2 * 60 * 1000,
            webhook_secret: None,
            admin_token: None,
            pay_address: pay_address.into(),
            chain: "SOL".to_string(),
            mint_allowlist: BTreeMap::new(),
            credits_per_unit: 100,
            min_topup_units: 5.0,
            match_window_ms: 24 * 60 * 60 * 1000,
            admission: AdmissionPolicy::default(),
            backend,
        }
    }

    /// Resolve configuration from the environment.
    ///
    /// Required: `POW_SECRET`, `PAY_ADDRESS`, and one of `LEDGER_DB` /
    /// `LEDGER_STATE_FILE`. Everything else has defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pow_secret = require("POW_SECRET")?.into_bytes();
        let pay_address = require("PAY_ADDRESS")?;

        let backend = match env_opt("LEDGER_DB") {
            Some(path) => StoreBackend::Sqlite {
                path: PathBuf::from(path),
            },
            None => StoreBackend::StateFile {
                path: env_opt("LEDGER_STATE_FILE")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::Missing("LEDGER_DB or LEDGER_STATE_FILE"))?,
            },
        };

        let mut mint_allowlist = BTreeMap::new();
        if let Some(mint) = env_opt("USDC_MINT") {
            mint_allowlist.insert(mint, "USDC".to_string());
        }
        if let Some(mint) = env_opt("USDT_MINT") {
            mint_allowlist.insert(mint, "USDT".to_string());
        }

        let mut config = Self::new(pow_secret, pay_address, backend);
        config.mint_allowlist = mint_allowlist;
        config.webhook_secret = env_opt("TOPUP_WEBHOOK_SECRET");
        config.admin_token = env_opt("ADMIN_TOKEN");
        if let Some(chain) = env_opt("PAY_CHAIN") {
            config.chain = chain.to_ascii_uppercase();
        }
        config.credits_per_unit = parse_opt("CREDITS_PER_UNIT", config.credits_per_unit)?;
        config.min_topup_units = parse_opt("MIN_TOPUP_UNITS", config.min_topup_units)?;
        config.pow_difficulty = parse_opt("POW_DIFFICULTY", config.pow_difficulty)?;
        config.pow_ttl_ms = parse_opt("POW_TTL_MS", config.pow_ttl_ms)?;
        let window_hours: i64 = parse_opt("MATCH_WINDOW_HOURS", 24)?;
        config.match_window_ms = window_hours * 60 * 60 * 1000;

        Ok(config)
    }

    /// Asset symbol for an allowlisted mint, if any.
    pub fn asset_for_mint(&self, mint: &str) -> Option<&str> {
        self.mint_allowlist.get(mint).map(String::as_str)
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env_opt(name).ok_or(ConfigError::Missing(name))
}

fn parse_opt<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_opt(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let config = MeterConfig::new(
            b"super-secret".to_vec(),
            "addr",
            StoreBackend::StateFile {
                path: PathBuf::from("ledger.json"),
            },
        );
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn defaults_match_pricing_policy() {
        let config = MeterConfig::new(
            b"s".to_vec(),
            "addr",
            StoreBackend::StateFile {
                path: PathBuf::from("ledger.json"),
            },
        );
        assert_eq!(config.credits_per_unit, 100);
        assert_eq!(config.min_topup_units, 5.0);
        assert_eq!(config.match_window_ms, 24 * 60 * 60 * 1000);
        assert_eq!(config.pow_difficulty, 4);
    }
}
