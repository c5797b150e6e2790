//! Per-broker connection configuration.
//!
//! Mirrors the `[broker]` sections of the platform's ini file: a host/port
//! pair per instrument plus the shared timeouts, with parameter aliases
//! letting well-known names (e.g. `depth`) track an instrument-specific
//! parameter (e.g. `depth_m`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_socket_timeout() -> u64 {
    5
}

fn default_resume_timeout() -> u64 {
    50
}

fn default_stale_time() -> u64 {
    10
}

/// Connection settings for one broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    pub port: u16,

    /// Default reply timeout in seconds.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u64,

    /// Reply timeout for `resume`, which can take much longer than any
    /// other request while the instrument starts up.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout: u64,

    /// Subscribed values older than this are refreshed before a read.
    #[serde(default = "default_stale_time")]
    pub stale_time: u64,

    /// alias name -> advertised parameter name
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl BrokerConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket_timeout: default_socket_timeout(),
            resume_timeout: default_resume_timeout(),
            stale_time: default_stale_time(),
            aliases: HashMap::new(),
        }
    }

    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    #[must_use]
    pub fn resume_timeout(&self) -> Duration {
        Duration::from_secs(self.resume_timeout)
    }

    #[must_use]
    pub fn stale_time(&self) -> Duration {
        Duration::from_secs(self.stale_time)
    }
}

/// Load a broker-name -> config map from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<HashMap<String, BrokerConfig>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
