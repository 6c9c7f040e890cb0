//! Environment-driven configuration for the relayer.
//!
//! Every limit the connection supervisor enforces is tunable here;
//! unset variables fall back to the defaults below.
//!
//! Variables:
//! - `HOST`, `PORT` — bind address
//! - `WS_MAX_CONNECTIONS` — connection cap
//! - `WS_IDLE_TIMEOUT_MS` — per-connection idle cutoff
//! - `RATE_LIMIT_MAX_MESSAGES`, `RATE_LIMIT_WINDOW_MS` — per-connection
//!   fixed-window message budget
//! - `WS_ALLOWED_ORIGINS` — comma-separated Origin allow-list; empty allows
//!   all origins
//! - `AUCTION_TTL_SECS` — base auction lifetime
//! - `BID_VERIFICATION_ENFORCED` — reject (instead of log) bids whose
//!   maker signature fails verification
//! - `RPC_URLS` — comma-separated `chainId=url` pairs for read-only RPC
//! - `EIP712_VERIFYING_CONTRACT` — domain parameter for bid approvals

use alloy_primitives::Address;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";
const ENV_MAX_CONNECTIONS: &str = "WS_MAX_CONNECTIONS";
const ENV_IDLE_TIMEOUT_MS: &str = "WS_IDLE_TIMEOUT_MS";
const ENV_RATE_LIMIT_MAX: &str = "RATE_LIMIT_MAX_MESSAGES";
const ENV_RATE_LIMIT_WINDOW_MS: &str = "RATE_LIMIT_WINDOW_MS";
const ENV_ALLOWED_ORIGINS: &str = "WS_ALLOWED_ORIGINS";
const ENV_AUCTION_TTL_SECS: &str = "AUCTION_TTL_SECS";
const ENV_BID_VERIFICATION_ENFORCED: &str = "BID_VERIFICATION_ENFORCED";
const ENV_RPC_URLS: &str = "RPC_URLS";
const ENV_VERIFYING_CONTRACT: &str = "EIP712_VERIFYING_CONTRACT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("env {0} is invalid: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub rate_limit_max_messages: u32,
    pub rate_limit_window: Duration,
    pub allowed_origins: Vec<String>,
    pub auction_ttl: Duration,
    pub bid_verification_enforced: bool,
    pub rpc_urls: HashMap<u64, Url>,
    pub verifying_contract: Address,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = parse_or(ENV_HOST, IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port = parse_or(ENV_PORT, 8080u16)?;
        let max_connections = parse_or(ENV_MAX_CONNECTIONS, 1024usize)?;
        let idle_timeout = Duration::from_millis(parse_or(ENV_IDLE_TIMEOUT_MS, 60_000u64)?);
        let rate_limit_max_messages = parse_or(ENV_RATE_LIMIT_MAX, 120u32)?;
        let rate_limit_window =
            Duration::from_millis(parse_or(ENV_RATE_LIMIT_WINDOW_MS, 10_000u64)?);
        let allowed_origins = split_csv(&env::var(ENV_ALLOWED_ORIGINS).unwrap_or_default());
        let auction_ttl = Duration::from_secs(parse_or(ENV_AUCTION_TTL_SECS, 600u64)?);
        let bid_verification_enforced = parse_or(ENV_BID_VERIFICATION_ENFORCED, false)?;
        let rpc_urls = parse_rpc_urls(&env::var(ENV_RPC_URLS).unwrap_or_default())
            .map_err(|detail| ConfigError::Invalid(ENV_RPC_URLS, detail))?;
        let verifying_contract = parse_or(ENV_VERIFYING_CONTRACT, Address::ZERO)?;

        Ok(Self {
            host,
            port,
            max_connections,
            idle_timeout,
            rate_limit_max_messages,
            rate_limit_window,
            allowed_origins,
            auction_ttl,
            bid_verification_enforced,
            rpc_urls,
            verifying_contract,
        })
    }

    /// Empty allow-list admits every origin; otherwise the request's
    /// `Origin` must be present and listed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|allowed| allowed == origin),
            None => false,
        }
    }
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `chainId=url` pairs: `42161=https://arb1.example,8453=https://base.example`.
fn parse_rpc_urls(raw: &str) -> Result<HashMap<u64, Url>, String> {
    let mut urls = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (chain, url) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected chainId=url, got {entry:?}"))?;
        let chain_id: u64 = chain
            .trim()
            .parse()
            .map_err(|_| format!("invalid chain id {chain:?}"))?;
        let url: Url = url
            .trim()
            .parse()
            .map_err(|_| format!("invalid url for chain {chain_id}"))?;
        urls.insert(chain_id, url);
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_origins(origins: &[&str]) -> Config {
        Config {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            max_connections: 16,
            idle_timeout: Duration::from_secs(60),
            rate_limit_max_messages: 120,
            rate_limit_window: Duration::from_secs(10),
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            auction_ttl: Duration::from_secs(600),
            bid_verification_enforced: false,
            rpc_urls: HashMap::new(),
            verifying_contract: Address::ZERO,
        }
    }

    #[test]
    fn empty_allow_list_admits_all_origins() {
        let config = config_with_origins(&[]);
        assert!(config.origin_allowed(Some("https://anywhere.example")));
        assert!(config.origin_allowed(None));
    }

    #[test]
    fn nonempty_allow_list_is_exact() {
        let config = config_with_origins(&["https://app.sapience.xyz"]);
        assert!(config.origin_allowed(Some("https://app.sapience.xyz")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
        assert!(!config.origin_allowed(None));
    }

    #[test]
    fn rpc_urls_parse_chain_pairs() {
        let urls = parse_rpc_urls("42161=https://arb1.example, 8453=https://base.example")
            .expect("parses");
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[&42161].as_str(), "https://arb1.example/");

        assert!(parse_rpc_urls("not-a-pair").is_err());
        assert!(parse_rpc_urls("abc=https://x.example").is_err());
        assert!(parse_rpc_urls("").expect("empty ok").is_empty());
    }
}
