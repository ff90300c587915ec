//! Server configuration
//!
//! Settings come from an optional TOML file overlaid with `SPEEDTEST_*`
//! environment variables. Key names match the classic `settings.toml`
//! layout so existing deployments keep working.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Statistics password shipped in the sample config; the viewer stays locked
/// until it is changed.
pub const DEFAULT_STATS_PASSWORD: &str = "PASSWORD";

const ENV_PREFIX: &str = "SPEEDTEST";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unsupported database type: {0}")]
    UnsupportedBackend(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the data-plane listener binds to
    pub bind_address: String,

    pub listen_port: u16,

    /// Admin HTTP listen address (health checks + metrics). Empty disables it.
    pub admin_listen: String,

    /// Size in bytes of the shared download block
    pub chunk_size: usize,

    /// Chunks served when the client omits or garbles `ckSize`
    pub download_chunks: usize,

    /// Upper bound on chunks served per download request
    pub max_chunks: usize,

    pub server_lat: f64,
    pub server_lng: f64,

    pub ipinfo_api_key: String,

    /// Base URL of the IP lookup service
    pub ipinfo_url: String,

    pub ipinfo_timeout_secs: u64,

    pub redact_ip_addresses: bool,

    pub statistics_password: String,

    /// One of `postgresql`, `mysql`, `sqlite`, `redb` (alias `bolt`), `memory`, `none`
    pub database_type: String,
    pub database_hostname: String,
    pub database_name: String,
    pub database_username: String,
    pub database_password: String,

    /// File used by the embedded and sqlite backends
    pub database_file: String,

    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            listen_port: 8989,
            admin_listen: "0.0.0.0:9090".to_string(),
            chunk_size: 1024 * 1024,
            download_chunks: 4,
            max_chunks: 1024,
            server_lat: 0.0,
            server_lng: 0.0,
            ipinfo_api_key: String::new(),
            ipinfo_url: "https://ipinfo.io".to_string(),
            ipinfo_timeout_secs: 5,
            redact_ip_addresses: false,
            statistics_password: DEFAULT_STATS_PASSWORD.to_string(),
            database_type: "memory".to_string(),
            database_hostname: "localhost".to_string(),
            database_name: "speedtest".to_string(),
            database_username: "postgres".to_string(),
            database_password: String::new(),
            database_file: "speedtest.redb".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

/// Connection parameters for the relational backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlSettings {
    /// Host, optionally with `:port`
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl SqlSettings {
    /// Split `hostname` into host and explicit port, if one was given.
    pub fn host_and_port(&self) -> (&str, Option<u16>) {
        match self.hostname.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (self.hostname.as_str(), None),
            },
            None => (self.hostname.as_str(), None),
        }
    }
}

/// Selected telemetry backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Postgres(SqlSettings),
    MySql(SqlSettings),
    Sqlite { path: String },
    Embedded { path: String },
    Memory,
    None,
}

/// Settings for the external IP lookup client
#[derive(Debug, Clone)]
pub struct LookupSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl ServerConfig {
    /// Load from `path` (or `./settings.toml` when present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf()).required(true),
            None => config::File::with_name("settings").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse settings from TOML text only, without consulting the environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0".into()));
        }
        if self.max_chunks == 0 {
            return Err(ConfigError::Invalid("max_chunks must be greater than 0".into()));
        }
        if self.download_chunks > self.max_chunks {
            return Err(ConfigError::Invalid(format!(
                "download_chunks ({}) exceeds max_chunks ({})",
                self.download_chunks, self.max_chunks
            )));
        }
        self.storage()?;
        Ok(())
    }

    /// `host:port` for the data-plane listener
    pub fn listen_addr(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.listen_port)
        } else {
            format!("{}:{}", self.bind_address, self.listen_port)
        }
    }

    pub fn admin_addr(&self) -> Option<&str> {
        let addr = self.admin_listen.trim();
        (!addr.is_empty()).then_some(addr)
    }

    pub fn storage(&self) -> Result<StorageConfig, ConfigError> {
        let sql = || SqlSettings {
            hostname: self.database_hostname.clone(),
            username: self.database_username.clone(),
            password: self.database_password.clone(),
            database: self.database_name.clone(),
        };

        match self.database_type.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(StorageConfig::Postgres(sql())),
            "mysql" => Ok(StorageConfig::MySql(sql())),
            "sqlite" => Ok(StorageConfig::Sqlite {
                path: self.database_file.clone(),
            }),
            "redb" | "bolt" => Ok(StorageConfig::Embedded {
                path: self.database_file.clone(),
            }),
            "memory" => Ok(StorageConfig::Memory),
            "none" => Ok(StorageConfig::None),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }

    pub fn lookup(&self) -> LookupSettings {
        LookupSettings {
            base_url: self.ipinfo_url.trim_end_matches('/').to_string(),
            api_key: (!self.ipinfo_api_key.is_empty()).then(|| self.ipinfo_api_key.clone()),
            timeout: Duration::from_secs(self.ipinfo_timeout_secs.max(1)),
        }
    }
}
