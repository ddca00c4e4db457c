//! Environment-derived configuration.
//!
//! Everything is optional except `DATABASE_URL`. Defaults target the BSC
//! mainnet prediction contract.

use chrono_tz::Tz;
use std::env;
use thiserror::Error;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_RPC_URL: &str = "RPC_URL";
pub const ENV_RPC_WS_URL: &str = "RPC_WS_URL";
pub const ENV_CONTRACT_ADDRESS: &str = "CONTRACT_ADDRESS";
pub const ENV_RATE_LIMIT_RPS: &str = "RATE_LIMIT_RPS";
pub const ENV_FANOUT_PORT: &str = "FANOUT_PORT";
pub const ENV_MULTI_CLAIM_THRESHOLD: &str = "MULTI_CLAIM_THRESHOLD";
pub const ENV_TIMEZONE: &str = "TIMEZONE";

const DEFAULT_RPC_URL: &str = "https://bsc-dataseed1.binance.org";
const DEFAULT_RPC_WS_URL: &str = "wss://bsc-rpc.publicnode.com";
const DEFAULT_CONTRACT_ADDRESS: &str = "0x18B2A687610328590Bc8F2e5fEdDe3b582A49cdA";
const DEFAULT_RATE_LIMIT_RPS: u32 = 100;
const DEFAULT_FANOUT_PORT: u16 = 3010;
const DEFAULT_MULTI_CLAIM_THRESHOLD: u32 = 3;
const DEFAULT_TIMEZONE: &str = "Asia/Taipei";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub rpc_url: String,
    pub rpc_ws_url: String,
    pub contract_address: String,
    pub rate_limit_rps: u32,
    pub fanout_port: u16,
    pub multi_claim_threshold: u32,
    pub timezone: Tz,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var(ENV_DATABASE_URL).map_err(|_| ConfigError::MissingEnv(ENV_DATABASE_URL))?;

        let timezone_name =
            env::var(ENV_TIMEZONE).unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                name: ENV_TIMEZONE,
                value: timezone_name.clone(),
            })?;

        Ok(Self {
            database_url,
            rpc_url: env::var(ENV_RPC_URL).unwrap_or_else(|_| DEFAULT_RPC_URL.to_string()),
            rpc_ws_url: env::var(ENV_RPC_WS_URL)
                .unwrap_or_else(|_| DEFAULT_RPC_WS_URL.to_string()),
            contract_address: env::var(ENV_CONTRACT_ADDRESS)
                .unwrap_or_else(|_| DEFAULT_CONTRACT_ADDRESS.to_string()),
            rate_limit_rps: parse_env(ENV_RATE_LIMIT_RPS, DEFAULT_RATE_LIMIT_RPS)?,
            fanout_port: parse_env(ENV_FANOUT_PORT, DEFAULT_FANOUT_PORT)?,
            multi_claim_threshold: parse_env(
                ENV_MULTI_CLAIM_THRESHOLD,
                DEFAULT_MULTI_CLAIM_THRESHOLD,
            )?,
            timezone,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timezone_parses() {
        let tz: Tz = DEFAULT_TIMEZONE.parse().unwrap();
        assert_eq!(tz.name(), "Asia/Taipei");
    }

    #[test]
    fn default_contract_is_checksum_hex() {
        assert!(DEFAULT_CONTRACT_ADDRESS.starts_with("0x"));
        assert_eq!(DEFAULT_CONTRACT_ADDRESS.len(), 42);
    }
}
