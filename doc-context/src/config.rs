//! Context configuration.
//!
//! Options are plain serde types so they can be embedded in a host
//! application's configuration file or loaded from a standalone TOML file.

use crate::error::{ContextError, ContextResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Logical database name handed to the driver.
    pub database: String,
    pub session: SessionOptions,
    pub find: FindOptions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            database: "default".to_string(),
            session: SessionOptions::default(),
            find: FindOptions::default(),
        }
    }
}

impl ContextOptions {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> ContextResult<Self> {
        toml::from_str(content).map_err(|e| ContextError::Config(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ContextResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ContextError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }
}

/// Options applied when the context starts its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub causal_consistency: bool,
    pub transaction: TransactionOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            causal_consistency: true,
            transaction: TransactionOptions::default(),
        }
    }
}

/// Defaults for transactions started on the session. `None` defers to the
/// server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub read_concern: Option<String>,
    pub write_concern: Option<String>,
    pub max_commit_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    /// Cursor batch size used when a query does not set one.
    pub batch_size: Option<u32>,
}
