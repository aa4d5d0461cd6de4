//! Configuration management for the server.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// JSON file of initial collections, `{"name": [records]}`
    pub seed_file: Option<PathBuf>,
    /// Collections that reject writes
    pub read_only: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            seed_file: None,
            read_only: HashSet::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let seed_file = env::var("SEED_FILE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let read_only = env::var("READ_ONLY")
            .map(|list| parse_list(&list))
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            seed_file,
            read_only,
        })
    }

    /// Mark a collection read-only.
    pub fn with_read_only(mut self, collection: impl Into<String>) -> Self {
        self.read_only.insert(collection.into());
        self
    }
}

/// Comma separated names, blanks dropped.
fn parse_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Cannot read seed file: {0}")]
    SeedUnreadable(#[from] std::io::Error),

    #[error("Invalid seed file: {0}")]
    InvalidSeed(String),
}
