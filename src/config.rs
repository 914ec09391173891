//! Server configuration.
//!
//! Values are layered with figment: built-in defaults, then an optional TOML
//! file, then `UIPROBE_*` environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides, e.g. `UIPROBE_DEFAULT_PORT=9000`.
pub const ENV_PREFIX: &str = "UIPROBE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the listener binds to.
    pub bind_address: IpAddr,
    /// First port tried when `start` is called without an explicit port.
    pub default_port: u16,
    /// Last port (inclusive) of the scan range.
    pub port_range_end: u16,

    /// Number of worker threads executing endpoint handlers.
    pub worker_threads: usize,
    /// Worker queue depth; submissions beyond it are rejected.
    pub queue_bound: usize,
    /// Queue depth of the stand-alone `MessageLoop`.
    pub ui_queue_bound: usize,

    pub ready_timeout_ms: u64,
    /// Upper bound on reading one request, however steadily bytes arrive.
    pub read_timeout_ms: u64,
    /// A connection is considered fully read after this long without new bytes.
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Bounded wait for in-flight jobs when the server stops.
    pub drain_timeout_ms: u64,
    pub max_request_bytes: usize,

    /// Directory of the discoverability file. Defaults to the directory of
    /// the running executable.
    pub run_file_dir: Option<PathBuf>,
    pub run_file_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            default_port: 8001,
            port_range_end: 8101,
            worker_threads: 4,
            queue_bound: 64,
            ui_queue_bound: 64,
            ready_timeout_ms: 1000,
            read_timeout_ms: 5000,
            idle_timeout_ms: 50,
            write_timeout_ms: 5000,
            drain_timeout_ms: 10_000,
            max_request_bytes: 16 * 1024 * 1024,
            run_file_dir: None,
            run_file_name: "uiprobe.run".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load the layered configuration. A missing file is not an error.
    pub fn load(file: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(file).extract()
    }

    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Resolve the discoverability file location.
    pub fn run_file_path(&self) -> PathBuf {
        let dir = self.run_file_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(std::env::temp_dir)
        });
        dir.join(&self.run_file_name)
    }
}
