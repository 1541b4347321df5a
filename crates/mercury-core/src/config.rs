//! Engine configuration.
//!
//! Settings come from defaults, then an optional JSON file, then
//! `MERCURY_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default IOPub data rate limit passed to the Jupyter server.
///
/// Large enough that plotting output is never throttled.
pub const DEFAULT_IOPUB_DATA_RATE_LIMIT: f64 = 10_000_000_000.0;

/// Configuration for sessions, execution, and replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MercuryConfig {
    /// Program used to launch Jupyter (`jupyter` resolved on PATH when unset).
    pub jupyter_command: Option<PathBuf>,
    /// Extra arguments placed before the generated ones (e.g. `["-m", "jupyter"]`).
    pub jupyter_args: Vec<String>,
    /// How long to wait for a launched server to report its URL.
    pub launch_timeout_ms: u64,
    /// Default timeout for in-place kernel restarts.
    pub restart_timeout_ms: u64,
    /// Default timeout for interrupts to settle.
    pub interrupt_timeout_ms: u64,
    /// `--NotebookApp.iopub_data_rate_limit` value for launched servers.
    pub iopub_data_rate_limit: f64,
    /// Launch servers with the user's Jupyter config instead of a blank one.
    pub use_default_config: bool,
    /// Change the kernel's working directory to the submitted file's directory.
    pub change_directory_on_run: bool,
    /// How long executed request ids are remembered for de-duplication.
    pub request_log_lifetime_ms: u64,
    /// How long produced responses are kept for guest catch-up.
    pub response_buffer_lifetime_ms: u64,
    /// Extra directories scanned for kernel specs (each holding `<name>/kernel.json`).
    pub kernel_spec_dirs: Vec<PathBuf>,
}

impl Default for MercuryConfig {
    fn default() -> Self {
        Self {
            jupyter_command: None,
            jupyter_args: Vec::new(),
            launch_timeout_ms: 60_000,
            restart_timeout_ms: 30_000,
            interrupt_timeout_ms: 10_000,
            iopub_data_rate_limit: DEFAULT_IOPUB_DATA_RATE_LIMIT,
            use_default_config: false,
            change_directory_on_run: true,
            request_log_lifetime_ms: 60_000,
            response_buffer_lifetime_ms: 5 * 60_000,
            kernel_spec_dirs: Vec::new(),
        }
    }
}

impl MercuryConfig {
    /// Default location of the config file (`<config_dir>/mercury/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mercury").join("config.json"))
    }

    /// Read a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(Error::from)
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist; the default path is used only if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `MERCURY_*` overrides from the given variable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup("MERCURY_JUPYTER") {
            self.jupyter_command = Some(PathBuf::from(cmd));
        }
        let millis = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(ms) = millis("MERCURY_LAUNCH_TIMEOUT_MS") {
            self.launch_timeout_ms = ms;
        }
        if let Some(ms) = millis("MERCURY_RESTART_TIMEOUT_MS") {
            self.restart_timeout_ms = ms;
        }
        if let Some(ms) = millis("MERCURY_INTERRUPT_TIMEOUT_MS") {
            self.interrupt_timeout_ms = ms;
        }
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn request_log_lifetime(&self) -> Duration {
        Duration::from_millis(self.request_log_lifetime_ms)
    }

    pub fn response_buffer_lifetime(&self) -> Duration {
        Duration::from_millis(self.response_buffer_lifetime_ms)
    }
}
