//! # Configuration Module
//!
//! Settings of the runtime, read from an optional JSON file next to the host executable.
//!
//! Every field has a default, and a missing file means all defaults. A config file only needs
//! to name the fields it changes:
//!
//! ```json
//! { "log_level": "trace", "retrigger_tls": false }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, Level};

use crate::errors::{InjectError, Result};
use crate::plugins::loader::DEFAULT_EXTENSION;

/// Where the runtime looks for its config file
pub const DEFAULT_CONFIG_PATH: &str = "./coreinject/config.json";
/// Where the runtime looks for plugin modules
pub const DEFAULT_PLUGIN_DIR: &str = "./coreinject/plugins";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory that is scanned for plugin modules
    pub plugin_dir: PathBuf,
    /// File name suffix of plugin modules
    pub plugin_extension: String,
    /// Log to this file instead of stderr, truncated at attach
    pub log_file: Option<PathBuf>,
    /// One of `error`, `warn`, `info`, `debug`, `trace`
    pub log_level: String,
    /// Start and join a thread after the TLS callback was restored, so that the
    /// platform runs the callback for a new thread
    pub retrigger_tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            plugin_extension: DEFAULT_EXTENSION.to_string(),
            log_file: None,
            log_level: "info".to_string(),
            retrigger_tls: true,
        }
    }
}

impl Config {
    /// Reads the config from the JSON file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// The configured log level
    pub fn level(&self) -> Result<Level> {
        Level::from_str(&self.log_level)
            .map_err(|e| InjectError::Logger(format!("bad log level {:?}: {e}", self.log_level)))
    }
}
