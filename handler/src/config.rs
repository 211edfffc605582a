//! A1 Config layer: layered `.env` + environment loading, per-field
//! validation, redacted `Debug` for anything holding a secret.
//!
//! Structured the way the teacher's `config::Config` is: one struct per
//! concern, `env::var("X").map_err(|_| eyre!(...))?` for required values,
//! `.ok().and_then(...).unwrap_or(default_x())` for optional ones.

use std::env;
use std::fmt;
use std::path::Path;

use chain_client::Redacted;
use eyre::{bail, eyre, Result, WrapErr};

use crate::db::models::NATIVE_COIN;

#[derive(Clone)]
pub struct Config {
    pub app_path: String,
    pub handler_name: String,
    pub handler_display: String,
    pub admin_seed: Redacted<String>,
    pub database: DatabaseConfig,
    pub db_secret_key: Redacted<[u8; 32]>,
    pub providers: ProviderConfig,
    pub scanner_url: String,
    pub coins: Vec<CoinConfig>,
    pub network: NetworkConfig,
    pub start_block: StartBlock,
    pub api: ApiConfig,
    pub dispatcher: DispatcherConfig,
    pub rates: RatesConfig,
    /// Size of the seed-derived SADMIN/APPROVE pools created at bootstrap
    /// (idempotent — re-running with the same seed and sizes is a no-op).
    pub admin_pool_size: u32,
    pub approve_pool_size: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_path", &self.app_path)
            .field("handler_name", &self.handler_name)
            .field("handler_display", &self.handler_display)
            .field("admin_seed", &self.admin_seed)
            .field("database", &self.database)
            .field("db_secret_key", &self.db_secret_key)
            .field("providers", &self.providers)
            .field("scanner_url", &self.scanner_url)
            .field("coins", &self.coins)
            .field("network", &self.network)
            .field("start_block", &self.start_block)
            .field("api", &self.api)
            .field("dispatcher", &self.dispatcher)
            .field("rates", &self.rates)
            .finish()
    }
}

/// `update_coin_rates` (§4.10): two independent public ticker endpoints,
/// queried with the coin symbol substituted for `{symbol}`, against a shared
/// quote asset. No exchange-rate source of truth is specified (§1
/// Non-goals) — these are opportunistic public tickers, not an oracle.
#[derive(Debug, Clone)]
pub struct RatesConfig {
    pub quote_symbol: String,
    pub primary_url_template: String,
    pub secondary_url_template: String,
    pub native_warning_threshold: bigdecimal::BigDecimal,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub write_dsn: Redacted<String>,
    pub read_dsn: Redacted<String>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("write_dsn", &self.write_dsn)
            .field("read_dsn", &self.read_dsn)
            .finish()
    }
}

#[derive(Clone)]
pub struct ProviderConfig {
    pub urls: Vec<String>,
    pub api_keys: Vec<Redacted<String>>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("urls", &self.urls)
            .field("api_keys", &vec!["<redacted>"; self.api_keys.len()])
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CoinConfig {
    pub name: String,
    pub decimals: i32,
    pub min_amount: bigdecimal::BigDecimal,
    pub fee_amount: bigdecimal::BigDecimal,
    pub contract_address: String,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub id: String,
    pub block_offset: u64,
    pub allowed_slippage: u64,
    pub scan_interval_secs: u64,
    pub is_evm: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum StartBlock {
    Latest,
    Number(u64),
}

#[derive(Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub metrics_addr: String,
    pub api_key: Redacted<String>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("metrics_addr", &self.metrics_addr)
            .field("api_key", &self.api_key)
            .finish()
    }
}

/// Credentials for calling back into the upstream Dispatcher (`PROC_URL`,
/// `PROC_API_KEY`).
#[derive(Clone)]
pub struct DispatcherConfig {
    pub url: String,
    pub api_key: Redacted<String>,
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .finish()
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_block_offset() -> u64 {
    2
}

fn default_allowed_slippage() -> u64 {
    2
}

fn default_scan_interval_secs() -> u64 {
    2
}

fn default_quote_symbol() -> String {
    "USDT".to_string()
}

fn default_rate_url_template(host: &str) -> String {
    format!("https://{host}/api/v3/ticker/price?symbol={{symbol}}{{quote}}")
}

fn default_native_warning_threshold() -> bigdecimal::BigDecimal {
    "2".parse().expect("literal parses")
}

fn default_admin_pool_size() -> u32 {
    3
}

fn default_approve_pool_size() -> u32 {
    3
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{name} environment variable is required"))
}

fn optional_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parses `"name|decimal|min|fee|address,…"` coin list entries.
pub fn parse_coins(raw: &str) -> Result<Vec<CoinConfig>> {
    let mut coins = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split('|').collect();
        if parts.len() != 5 {
            bail!("malformed coin entry {entry:?}: expected name|decimal|min|fee|address");
        }
        coins.push(CoinConfig {
            name: parts[0].to_string(),
            decimals: parts[1].parse().wrap_err_with(|| format!("bad decimals in {entry:?}"))?,
            min_amount: parts[2]
                .parse()
                .wrap_err_with(|| format!("bad min_amount in {entry:?}"))?,
            fee_amount: parts[3]
                .parse()
                .wrap_err_with(|| format!("bad fee_amount in {entry:?}"))?,
            contract_address: parts[4].to_string(),
        });
    }
    Ok(coins)
}

impl Config {
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let db_secret_key_raw = required("PROC_HANDLER_DB_SECRET_KEY")?;
        let db_secret_key = parse_db_secret_key(&db_secret_key_raw)?;

        let provider_urls =
            chain_client::parse_rpc_urls(&required("PROC_HANDLER_PROVIDER_URL")?);
        if provider_urls.is_empty() {
            bail!("PROC_HANDLER_PROVIDER_URL must list at least one RPC endpoint");
        }
        let provider_api_keys = chain_client::parse_api_keys(
            &env::var("PROC_HANDLER_PROVIDER_API_KEYS").unwrap_or_default(),
        )
        .into_iter()
        .map(Redacted)
        .collect();

        let network_name = required("PROC_HANDLER_NETWORK_NAME")?;
        let is_evm = !network_name.to_lowercase().contains("terra")
            && !network_name.to_lowercase().contains("tvm");

        let start_block_raw = required("PROC_HANDLER_START_BLOCK")?;
        let start_block = if start_block_raw.eq_ignore_ascii_case("latest") {
            StartBlock::Latest
        } else {
            StartBlock::Number(
                start_block_raw
                    .parse()
                    .wrap_err("PROC_HANDLER_START_BLOCK must be \"latest\" or an integer")?,
            )
        };

        let config = Config {
            app_path: required("APP_PATH")?,
            handler_name: required("PROC_HANDLER_NAME")?,
            handler_display: required("PROC_HANDLER_DISPLAY")?,
            admin_seed: Redacted(required("PROC_HANDLER_ADMIN_SEED")?),
            database: DatabaseConfig {
                write_dsn: Redacted(required("PROC_HANDLER_WRITE_DSN")?),
                read_dsn: Redacted(required("PROC_HANDLER_READ_DSN")?),
            },
            db_secret_key: Redacted(db_secret_key),
            providers: ProviderConfig {
                urls: provider_urls,
                api_keys: provider_api_keys,
            },
            scanner_url: required("PROC_HANDLER_SCANNER_URL")?,
            coins: parse_coins(&required("PROC_HANDLER_COINS")?)?,
            network: NetworkConfig {
                name: network_name,
                id: required("PROC_HANDLER_NETWORK_ID")?,
                block_offset: optional_parse("PROC_HANDLER_BLOCK_OFFSET", default_block_offset()),
                allowed_slippage: optional_parse(
                    "PROC_HANDLER_ALLOWED_SLIPPAGE",
                    default_allowed_slippage(),
                ),
                scan_interval_secs: optional_parse(
                    "PROC_HANDLER_SCAN_INTERVAL_SECS",
                    default_scan_interval_secs(),
                ),
                is_evm,
            },
            start_block,
            api: ApiConfig {
                bind_addr: env::var("PROC_HANDLER_BIND_ADDR").unwrap_or_else(|_| default_bind_addr()),
                metrics_addr: env::var("PROC_HANDLER_METRICS_ADDR")
                    .unwrap_or_else(|_| default_metrics_addr()),
                api_key: Redacted(required("PROC_HANDLER_API_KEY")?),
            },
            dispatcher: DispatcherConfig {
                url: required("PROC_URL")?,
                api_key: Redacted(required("PROC_API_KEY")?),
            },
            rates: RatesConfig {
                quote_symbol: env::var("PROC_HANDLER_QUOTE_SYMBOL")
                    .unwrap_or_else(|_| default_quote_symbol()),
                primary_url_template: env::var("PROC_HANDLER_RATE_SOURCE_PRIMARY")
                    .unwrap_or_else(|_| default_rate_url_template("api.binance.com")),
                secondary_url_template: env::var("PROC_HANDLER_RATE_SOURCE_SECONDARY")
                    .unwrap_or_else(|_| default_rate_url_template("api1.binance.com")),
                native_warning_threshold: env::var("PROC_HANDLER_NATIVE_WARNING_THRESHOLD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_native_warning_threshold),
            },
            admin_pool_size: optional_parse("PROC_HANDLER_ADMIN_POOL_SIZE", default_admin_pool_size()),
            approve_pool_size: optional_parse("PROC_HANDLER_APPROVE_POOL_SIZE", default_approve_pool_size()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db_secret_key.0.len() != 32 {
            bail!("PROC_HANDLER_DB_SECRET_KEY must decode to exactly 32 bytes");
        }
        let word_count = self.admin_seed.0.split_whitespace().count();
        if !(12..=24).contains(&word_count) || word_count % 3 != 0 {
            bail!("PROC_HANDLER_ADMIN_SEED does not look like a BIP39 mnemonic");
        }
        if self.coins.iter().all(|c| c.contract_address != NATIVE_COIN) {
            bail!("PROC_HANDLER_COINS must include exactly one entry with address \"{NATIVE_COIN}\"");
        }
        for coin in &self.coins {
            if coin.decimals <= 0 {
                bail!("coin {} must have decimals > 0", coin.name);
            }
            if coin.min_amount <= 0.into() {
                bail!("coin {} must have min_amount > 0", coin.name);
            }
        }
        if self.network.allowed_slippage == 0 {
            bail!("PROC_HANDLER_ALLOWED_SLIPPAGE must be > 0");
        }
        url::Url::parse(&self.scanner_url).wrap_err("PROC_HANDLER_SCANNER_URL is not a valid URL")?;
        url::Url::parse(&self.dispatcher.url).wrap_err("PROC_URL is not a valid URL")?;
        if self.admin_pool_size == 0 || self.approve_pool_size == 0 {
            bail!("PROC_HANDLER_ADMIN_POOL_SIZE and PROC_HANDLER_APPROVE_POOL_SIZE must be > 0");
        }
        Ok(())
    }
}

fn parse_db_secret_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(raw).wrap_err("PROC_HANDLER_DB_SECRET_KEY is not valid hex")?
    } else {
        raw.as_bytes().to_vec()
    };
    if bytes.len() != 32 {
        bail!("PROC_HANDLER_DB_SECRET_KEY must be 32 bytes (raw or 64 hex chars)");
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coin_list() {
        let coins = parse_coins("native|18|10000000000000000|0|native,USDT|6|1000000|0|0xAbC").unwrap();
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[0].name, "native");
        assert_eq!(coins[1].decimals, 6);
        assert_eq!(coins[1].contract_address, "0xAbC");
    }

    #[test]
    fn rejects_malformed_coin_entry() {
        assert!(parse_coins("native|18|0").is_err());
    }

    #[test]
    fn db_secret_key_accepts_hex_or_raw() {
        let hex_key = "0".repeat(64);
        assert_eq!(parse_db_secret_key(&hex_key).unwrap(), [0u8; 32]);
        let raw_key = "x".repeat(32);
        assert_eq!(parse_db_secret_key(&raw_key).unwrap(), [b'x'; 32]);
        assert!(parse_db_secret_key("too-short").is_err());
    }
}
