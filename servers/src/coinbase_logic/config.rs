use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::core::backoff::ReconnectPolicy;
use lib_common::core::relay::RelayConfig;
use lib_common::ingestors::coinbase_wss::CoinbaseConfig;

const DEFAULT_CONFIG_FILE: &str = "server_coinbase.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Coinbase market-data WebSocket relay", version)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[clap(long, env = "COINBASE_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "COINBASE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "COINBASE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "COINBASE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "COINBASE_WS_URL", help = "Upstream Coinbase WebSocket feed URL.")]
    pub coinbase_ws_url: Option<String>,

    #[clap(
        long,
        env = "COINBASE_PRODUCTS",
        value_delimiter = ',',
        help = "Comma separated list of supported product ids."
    )]
    pub products: Option<Vec<String>>,

    #[clap(long, env = "COINBASE_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "COINBASE_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "COINBASE_MAX_RECONNECT_ATTEMPTS", help = "Reconnect attempts before the upstream feed is declared failed.")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "COINBASE_HEARTBEAT_INTERVAL_SECONDS", help = "Seconds between upstream liveness pings.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "COINBASE_CLIENT_BUFFER_SIZE", help = "Outbound queue capacity per client, in frames.")]
    pub client_buffer_size: Option<usize>,
}

impl Config {
    fn defaults() -> Config {
        let feed = CoinbaseConfig::default();
        Config {
            port: Some(9003),
            config_path: None,
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            coinbase_ws_url: Some(feed.url),
            products: Some(feed.products),
            reconnect_base_delay_ms: Some(feed.reconnect.initial_delay.as_millis() as u64),
            reconnect_max_delay_ms: Some(feed.reconnect.max_delay.as_millis() as u64),
            max_reconnect_attempts: Some(feed.reconnect.max_attempts),
            heartbeat_interval_seconds: Some(feed.heartbeat_interval.as_secs()),
            client_buffer_size: Some(RelayConfig::default().client_buffer_size),
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            coinbase_ws_url: other.coinbase_ws_url.or(self.coinbase_ws_url),
            products: other.products.or(self.products),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            heartbeat_interval_seconds: other
                .heartbeat_interval_seconds
                .or(self.heartbeat_interval_seconds),
            client_buffer_size: other.client_buffer_size.or(self.client_buffer_size),
        }
    }
}

/// Fully resolved settings. Every field has a value and has been validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub relay: RelayConfig,
}

impl TryFrom<Config> for Settings {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> Result<Self> {
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let products: Vec<String> = config
            .products
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if products.is_empty() {
            bail!("at least one product must be configured");
        }

        let initial_delay = config.reconnect_base_delay_ms.unwrap_or(1000);
        let max_delay = config.reconnect_max_delay_ms.unwrap_or(30000);
        if initial_delay == 0 {
            bail!("reconnect base delay must be positive");
        }
        if initial_delay > max_delay {
            bail!(
                "reconnect base delay ({}ms) exceeds max delay ({}ms)",
                initial_delay,
                max_delay
            );
        }

        let heartbeat = config.heartbeat_interval_seconds.unwrap_or(30);
        if heartbeat == 0 {
            bail!("heartbeat interval must be positive");
        }

        let client_buffer_size = config.client_buffer_size.unwrap_or(256);
        if client_buffer_size == 0 {
            bail!("client buffer size must be positive");
        }

        let feed_defaults = CoinbaseConfig::default();
        Ok(Settings {
            port: config.port.unwrap_or(9003),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            relay: RelayConfig {
                feed: CoinbaseConfig {
                    url: config.coinbase_ws_url.unwrap_or(feed_defaults.url),
                    products,
                    channels: feed_defaults.channels,
                    heartbeat_interval: Duration::from_secs(heartbeat),
                    reconnect: ReconnectPolicy {
                        initial_delay: Duration::from_millis(initial_delay),
                        max_delay: Duration::from_millis(max_delay),
                        max_attempts: config
                            .max_reconnect_attempts
                            .unwrap_or(feed_defaults.reconnect.max_attempts),
                    },
                },
                client_buffer_size,
            },
        })
    }
}

/// Reads a JSON config file. A missing file is not an error; a malformed one is.
fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = serde_json::from_str::<Config>(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(config))
}

/// Resolves settings from defaults < config file < environment / CLI.
pub fn resolve(cli: Config) -> Result<Settings> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path)? {
        current = current.merge(file_config);
    }
    current = current.merge(cli);

    Settings::try_from(current)
}

pub fn load_config() -> Result<Settings> {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Config {
        let mut argv = vec!["server_coinbase"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let settings = Settings::try_from(Config::default()).unwrap();
        assert_eq!(settings.port, 9003);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.relay.client_buffer_size, 256);

        let feed = &settings.relay.feed;
        assert_eq!(feed.url, "wss://ws-feed.exchange.coinbase.com");
        assert_eq!(feed.products, vec!["BTC-USD", "ETH-USD", "XRP-USD", "LTC-USD"]);
        assert_eq!(feed.channels, vec!["ticker", "matches"]);
        assert_eq!(feed.reconnect, ReconnectPolicy::default());
        assert_eq!(feed.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let file = write_file(
            r#"{"port": 8000, "logLevel": "debug", "products": ["BTC-USD"], "maxReconnectAttempts": 2}"#,
        );
        let path = file.path().to_str().unwrap();
        let settings = resolve(cli(&["--config-path", path, "--port", "8100"])).unwrap();

        assert_eq!(settings.port, 8100);
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.relay.feed.products, vec!["BTC-USD"]);
        assert_eq!(settings.relay.feed.reconnect.max_attempts, 2);
        // untouched by either source
        assert_eq!(settings.relay.feed.reconnect.max_delay, Duration::from_millis(30000));
    }

    #[test]
    fn test_cli_products_are_comma_separated() {
        let config = cli(&["--products", "BTC-USD, ETH-USD"]);
        let settings = Settings::try_from(config).unwrap();
        assert_eq!(settings.relay.feed.products, vec!["BTC-USD", "ETH-USD"]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.conf");
        let settings = resolve(cli(&["--config-path", missing.to_str().unwrap()])).unwrap();
        assert_eq!(settings.port, 9003);
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let file = write_file("{ not json");
        let path = file.path().to_str().unwrap();
        assert!(resolve(cli(&["--config-path", path])).is_err());
    }

    #[test]
    fn test_invalid_combinations_are_rejected() {
        let empty_products = Config {
            products: Some(vec![" ".to_string()]),
            ..Config::default()
        };
        assert!(Settings::try_from(empty_products).is_err());

        let inverted_delays = Config {
            reconnect_base_delay_ms: Some(5000),
            reconnect_max_delay_ms: Some(1000),
            ..Config::default()
        };
        assert!(Settings::try_from(inverted_delays).is_err());

        let zero_buffer = Config {
            client_buffer_size: Some(0),
            ..Config::default()
        };
        assert!(Settings::try_from(zero_buffer).is_err());
    }
}
