use std::{env, fs::File, io::BufReader, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StoreError},
    sqlite::MEMORY_DATABASE,
    types::{DEFAULT_TEXT_LENGTH, TypeMap},
};

pub const ENV_DATABASE: &str = "SERIES_STORE_DATABASE";
pub const ENV_POOL_SIZE: &str = "SERIES_STORE_POOL_SIZE";
pub const ENV_BUSY_TIMEOUT_MS: &str = "SERIES_STORE_BUSY_TIMEOUT_MS";
pub const ENV_TEXT_LENGTH: &str = "SERIES_STORE_TEXT_LENGTH";

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Connection settings handed to [`Store::open`](crate::store::Store::open).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file path, or `:memory:` for a private in-memory database.
    pub database: String,
    /// Idle connections kept by the pool.
    #[serde(default = "StoreConfig::default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "StoreConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Length of bounded text columns in the default type map.
    #[serde(default = "StoreConfig::default_text_length")]
    pub text_length: u32,
}

impl StoreConfig {
    pub fn new(database: impl Into<String>) -> Self {
        StoreConfig {
            database: database.into(),
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            text_length: DEFAULT_TEXT_LENGTH,
        }
    }

    pub fn in_memory() -> Self {
        StoreConfig::new(MEMORY_DATABASE)
    }

    pub fn with_database_path(path: &Path) -> Self {
        StoreConfig::new(path.to_string_lossy())
    }

    pub const fn default_pool_size() -> usize {
        DEFAULT_POOL_SIZE
    }

    pub const fn default_busy_timeout_ms() -> u64 {
        DEFAULT_BUSY_TIMEOUT_MS
    }

    pub const fn default_text_length() -> u32 {
        DEFAULT_TEXT_LENGTH
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let reader = BufReader::new(file);
        let config: StoreConfig =
            serde_yaml::from_reader(reader).context("Parsing store config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the `SERIES_STORE_*` variables. Only the database is required.
    pub fn from_env() -> Result<Self> {
        let database = env::var(ENV_DATABASE)
            .map_err(|_| StoreError::Config(format!("environment variable {ENV_DATABASE} is not set")))?;
        let mut config = StoreConfig::new(database);
        if let Some(pool_size) = parse_env(ENV_POOL_SIZE)? {
            config.pool_size = pool_size;
        }
        if let Some(timeout) = parse_env(ENV_BUSY_TIMEOUT_MS)? {
            config.busy_timeout_ms = timeout;
        }
        if let Some(length) = parse_env(ENV_TEXT_LENGTH)? {
            config.text_length = length;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(StoreError::Config("database must not be empty".to_string()));
        }
        if self.text_length == 0 {
            return Err(StoreError::Config("text_length must be positive".to_string()));
        }
        Ok(())
    }

    pub fn type_map(&self) -> TypeMap {
        TypeMap::with_text_length(self.text_length)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Config(format!("{name}='{raw}' is not a valid number"))),
        Err(_) => Ok(None),
    }
}
