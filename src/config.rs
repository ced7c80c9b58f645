use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the withdrawer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub coin: CoinConfig,
    pub withdraw: WithdrawConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// The asset this instance serves and how to reach its node
#[derive(Clone, Deserialize)]
pub struct CoinConfig {
    /// Upper-case ticker, e.g. "BTC"
    pub name: String,
    /// Blocks required on top of the inclusion height before finality
    #[serde(default = "default_stable_depth")]
    pub stable: u64,
    pub rpc_url: String,
    /// Additional RPC URLs tried in order when the primary fails
    #[serde(default)]
    pub rpc_fallback_urls: Vec<String>,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password: Option<String>,
}

/// Custom Debug that redacts the RPC password.
impl fmt::Debug for CoinConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoinConfig")
            .field("name", &self.name)
            .field("stable", &self.stable)
            .field("rpc_url", &self.rpc_url)
            .field("rpc_fallback_urls", &self.rpc_fallback_urls)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &self.rpc_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CoinConfig {
    /// All RPC URLs: primary followed by fallbacks.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self.rpc_url.clone()];
        urls.extend(self.rpc_fallback_urls.iter().cloned());
        urls
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawConfig {
    #[serde(default = "default_poll_interval")]
    pub dispatch_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub confirm_poll_interval_ms: u64,
    /// Dispatch passes to skip after the node returns an empty tx hash
    #[serde(default = "default_empty_hash_backoff")]
    pub empty_hash_backoff_passes: u32,
    /// Log a "still waiting" line every N unsuccessful inclusion polls
    #[serde(default = "default_progress_log_every")]
    pub progress_log_every: u64,
    #[serde(default = "default_queue_size")]
    pub inbound_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub notify_queue_size: usize,
}

impl WithdrawConfig {
    pub fn dispatch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_interval_ms)
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }
}

impl Default for WithdrawConfig {
    fn default() -> Self {
        Self {
            dispatch_poll_interval_ms: default_poll_interval(),
            confirm_poll_interval_ms: default_poll_interval(),
            empty_hash_backoff_passes: default_empty_hash_backoff(),
            progress_log_every: default_progress_log_every(),
            inbound_queue_size: default_queue_size(),
            notify_queue_size: default_queue_size(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Default functions
fn default_stable_depth() -> u64 {
    6
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_empty_hash_backoff() -> u32 {
    100_000
}

fn default_progress_log_every() -> u64 {
    100
}

fn default_queue_size() -> usize {
    1024
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8037
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let rpc_raw = env::var("COIN_RPC_URL")
            .map_err(|_| eyre!("COIN_RPC_URL environment variable is required"))?;
        let rpc_urls = parse_rpc_urls(&rpc_raw);
        if rpc_urls.is_empty() {
            return Err(eyre!("COIN_RPC_URL cannot be empty"));
        }

        let coin = CoinConfig {
            name: env::var("COIN_NAME")
                .map_err(|_| eyre!("COIN_NAME environment variable is required"))?
                .trim()
                .to_uppercase(),
            stable: env_or("COIN_STABLE", default_stable_depth()),
            rpc_url: rpc_urls[0].clone(),
            rpc_fallback_urls: rpc_urls[1..].to_vec(),
            rpc_user: env::var("COIN_RPC_USER").ok(),
            rpc_password: env::var("COIN_RPC_PASSWORD").ok(),
        };

        let withdraw = WithdrawConfig {
            dispatch_poll_interval_ms: env_or("DISPATCH_POLL_INTERVAL_MS", default_poll_interval()),
            confirm_poll_interval_ms: env_or("CONFIRM_POLL_INTERVAL_MS", default_poll_interval()),
            empty_hash_backoff_passes: env_or(
                "EMPTY_HASH_BACKOFF_PASSES",
                default_empty_hash_backoff(),
            ),
            progress_log_every: env_or("PROGRESS_LOG_EVERY", default_progress_log_every()),
            inbound_queue_size: env_or("INBOUND_QUEUE_SIZE", default_queue_size()),
            notify_queue_size: env_or("NOTIFY_QUEUE_SIZE", default_queue_size()),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            port: env_or("API_PORT", default_api_port()),
        };

        let config = Config {
            database,
            coin,
            withdraw,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.coin.name.len() < 3 || !self.coin.name.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(eyre!(
                "coin.name must be an upper-case ticker of at least 3 letters, got {:?}",
                self.coin.name
            ));
        }

        if self.coin.rpc_url.is_empty() {
            return Err(eyre!("coin.rpc_url cannot be empty"));
        }

        if self.coin.rpc_user.is_some() != self.coin.rpc_password.is_some() {
            return Err(eyre!(
                "COIN_RPC_USER and COIN_RPC_PASSWORD must be set together"
            ));
        }

        if self.withdraw.inbound_queue_size == 0 || self.withdraw.notify_queue_size == 0 {
            return Err(eyre!("queue sizes must be greater than zero"));
        }

        if self.withdraw.progress_log_every == 0 {
            return Err(eyre!("withdraw.progress_log_every must be greater than zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            coin: CoinConfig {
                name: "BTC".to_string(),
                stable: 6,
                rpc_url: "http://localhost:8332".to_string(),
                rpc_fallback_urls: vec![],
                rpc_user: Some("user".to_string()),
                rpc_password: Some("secret".to_string()),
            },
            withdraw: WithdrawConfig::default(),
            api: ApiConfig {
                bind_address: default_bind_address(),
                port: default_api_port(),
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_stable_depth(), 6);
        assert_eq!(default_poll_interval(), 1000);
        assert_eq!(default_empty_hash_backoff(), 100_000);
        assert_eq!(default_progress_log_every(), 100);
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_coin_name_validation() {
        let mut config = test_config();
        config.coin.name = "btc".to_string();
        assert!(config.validate().is_err());

        config.coin.name = "BT".to_string();
        assert!(config.validate().is_err());

        config.coin.name = "USDT".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rpc_credentials_must_pair() {
        let mut config = test_config();
        config.coin.rpc_password = None;
        assert!(config.validate().is_err());

        config.coin.rpc_user = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = test_config();
        config.withdraw.notify_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = test_config();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("postgres://"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_parse_rpc_urls() {
        let urls = parse_rpc_urls(" http://a:8332 ,,http://b:8332,");
        assert_eq!(urls, vec!["http://a:8332", "http://b:8332"]);
        assert!(parse_rpc_urls("").is_empty());
    }

    #[test]
    fn test_all_rpc_urls_order() {
        let mut config = test_config();
        config.coin.rpc_fallback_urls = vec!["http://backup:8332".to_string()];
        assert_eq!(
            config.coin.all_rpc_urls(),
            vec!["http://localhost:8332", "http://backup:8332"]
        );
    }
}
