//! A1 Config layer, structured exactly as the Handler's `config::Config`
//! (one struct per concern, `env::var` + `eyre!` for required values,
//! `.ok().and_then(...).unwrap_or(default_x())` for optional ones).

use std::env;
use std::fmt;
use std::path::Path;

use eyre::{bail, eyre, Result, WrapErr};

use crate::redact::Redacted;

#[derive(Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub db_secret_key: Redacted<[u8; 32]>,
    pub api: ApiConfig,
    pub network_handlers: Vec<NetworkHandlerConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database", &self.database)
            .field("db_secret_key", &self.db_secret_key)
            .field("api", &self.api)
            .field("network_handlers", &self.network_handlers)
            .finish()
    }
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
pub struct ApiConfig {
    pub bind_addr: String,
    pub metrics_addr: String,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}

/// One entry from `PROC_API_NETWORK_HANDLERS`
/// (`name|display_name|server_url|api_key,...`), loaded once at startup into
/// the `network_handlers` table.
#[derive(Clone)]
pub struct NetworkHandlerConfig {
    pub name: String,
    pub display_name: String,
    pub server_url: String,
    pub api_key: Redacted<String>,
}

impl fmt::Debug for NetworkHandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkHandlerConfig")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("server_url", &self.server_url)
            .field("api_key", &self.api_key)
            .finish()
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{name} environment variable is required"))
}

/// Parses `"name|display_name|server_url|api_key,…"` entries.
pub fn parse_network_handlers(raw: &str) -> Result<Vec<NetworkHandlerConfig>> {
    let mut handlers = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split('|').collect();
        if parts.len() != 4 {
            bail!("malformed network handler entry {entry:?}: expected name|display_name|server_url|api_key");
        }
        handlers.push(NetworkHandlerConfig {
            name: parts[0].to_string(),
            display_name: parts[1].to_string(),
            server_url: parts[2].to_string(),
            api_key: Redacted(parts[3].to_string()),
        });
    }
    Ok(handlers)
}

fn parse_db_secret_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(raw).wrap_err("PROC_API_DB_SECRET_KEY is not valid hex")?
    } else {
        raw.as_bytes().to_vec()
    };
    if bytes.len() != 32 {
        bail!("PROC_API_DB_SECRET_KEY must be 32 bytes (raw or 64 hex chars)");
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl Config {
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let db_secret_key_raw = required("PROC_API_DB_SECRET_KEY")?;
        let db_secret_key = parse_db_secret_key(&db_secret_key_raw)?;

        let config = Config {
            database: DatabaseConfig {
                write_dsn: Redacted(required("PROC_API_WRITE_DSN")?),
                read_dsn: Redacted(required("PROC_API_READ_DSN")?),
            },
            db_secret_key: Redacted(db_secret_key),
            api: ApiConfig {
                bind_addr: env::var("PROC_API_BIND_ADDR").unwrap_or_else(|_| default_bind_addr()),
                metrics_addr: env::var("PROC_API_METRICS_ADDR").unwrap_or_else(|_| default_metrics_addr()),
            },
            network_handlers: parse_network_handlers(&required("PROC_API_NETWORK_HANDLERS")?)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db_secret_key.0.len() != 32 {
            bail!("PROC_API_DB_SECRET_KEY must decode to exactly 32 bytes");
        }
        if self.network_handlers.is_empty() {
            bail!("PROC_API_NETWORK_HANDLERS must list at least one network handler");
        }
        for handler in &self.network_handlers {
            url::Url::parse(&handler.server_url)
                .wrap_err_with(|| format!("network handler {:?} has an invalid server_url", handler.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_handler_list() {
        let handlers = parse_network_handlers("eth|Ethereum|http://h1:8080|key1,terra|Terra|http://h2:8080|key2").unwrap();
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name, "eth");
        assert_eq!(handlers[1].server_url, "http://h2:8080");
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(parse_network_handlers("eth|Ethereum|http://h1:8080").is_err());
    }

    #[test]
    fn db_secret_key_accepts_hex_or_raw() {
        let hex_key = "0".repeat(64);
        assert_eq!(parse_db_secret_key(&hex_key).unwrap(), [0u8; 32]);
        assert!(parse_db_secret_key("too-short").is_err());
    }
}
