//! Cache configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A collaborator the cache cannot run without was never installed.
    #[error("cache builder is missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Identity field looked for on every response object; objects
    /// carrying it are normalized into entities.
    pub id_field: String,
    /// The four reserved cursor argument names.
    pub pagination: PaginationWords,
    /// Log cache decisions (pending joins, flushes) at debug level.
    pub debug: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            pagination: PaginationWords::default(),
            debug: false,
            logging: LoggingConfig::default(),
        }
    }
}

/// Renames of the reserved pagination argument words.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationWords {
    pub before: String,
    pub after: String,
    pub first: String,
    pub last: String,
}

impl Default for PaginationWords {
    fn default() -> Self {
        Self {
            before: "before".to_string(),
            after: "after".to_string(),
            first: "first".to_string(),
            last: "last".to_string(),
        }
    }
}

impl PaginationWords {
    pub fn is_pagination(&self, arg: &str) -> bool {
        arg == self.before || arg == self.after || arg == self.first || arg == self.last
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stderr: bool,
    pub format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stderr: true,
            format: LogFormat::Compact,
            filter: None,
        }
    }
}
