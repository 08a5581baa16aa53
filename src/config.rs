use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

pub const ENV_PREFIX: &str = "CAREBOOK_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Server settings, read from `CAREBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            password: "carebook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Build from a key lookup (keys without the prefix). Unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind: lookup("BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("carebook.wal")
    }
}
