//! Tunables shared by logs and databases.

use crate::Result;
use crate::constants::{DEFAULT_FETCH_TIMEOUT, DEFAULT_POINTER_COUNT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication tunables for a log.
///
/// Can be built in code or loaded from JSON; missing fields take their defaults.
///
/// ```
/// # use peerlog::config::LogConfig;
/// let config = LogConfig::from_json(r#"{"pointer_count": 8}"#).unwrap();
/// assert_eq!(config.pointer_count, 8);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum number of `refs` attached to each appended entry.
    pub pointer_count: usize,
    /// Bound on each ancestor fetch while joining, in milliseconds.
    pub fetch_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            pointer_count: DEFAULT_POINTER_COUNT,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LogConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
