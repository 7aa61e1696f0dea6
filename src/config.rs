//! Application configuration via Figment (TOML file + environment overrides).
//!
//! Settings are loaded from an optional TOML file merged with `LABLINK_*`
//! environment variables, then validated semantically. Parsing failures and
//! validation failures both surface as [`LabError::Configuration`], which maps
//! to exit code 1 in the CLI front-ends.
//!
//! Layout mirrors the deployment topology: a `[server]` section for the local
//! instrument server, `[[drivers]]` entries naming the hardware to host,
//! `[data_server]` for the pub/sub hub, and `[[tunnels]]` for remote
//! instrument servers reached through an SSH forward.

use crate::error::{LabError, LabResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default listen port for the primary instrument server.
pub const DEFAULT_INSERV_PORT: u16 = 42068;
/// Default listen port for the data server.
pub const DEFAULT_DATASERV_PORT: u16 = 30101;

/// Top-level settings for a deployment.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Settings {
    /// Local instrument server settings.
    #[serde(default)]
    pub server: ServerSettings,
    /// Drivers to instantiate at server startup.
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
    /// Data server settings.
    #[serde(default)]
    pub data_server: DataServerSettings,
    /// Tunnels to remote instrument servers.
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

/// Instrument server network settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Listen address. Loopback by default; servers meant to be remote-reachable
    /// opt in explicitly.
    #[serde(default = "default_inserv_addr")]
    pub listen_addr: String,
    /// Upper bound on queued calls per driver before callers see backpressure.
    #[serde(default = "default_call_queue")]
    pub call_queue_capacity: usize,
    /// Bound on any single driver call before the server reports a timeout.
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
}

fn default_inserv_addr() -> String {
    format!("127.0.0.1:{DEFAULT_INSERV_PORT}")
}

fn default_call_queue() -> usize {
    64
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_inserv_addr(),
            call_queue_capacity: default_call_queue(),
            call_timeout: default_call_timeout(),
        }
    }
}

/// One driver to instantiate at server startup.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DriverConfig {
    /// Alias for the device, unique within the server.
    pub name: String,
    /// Which registered driver implementation to construct.
    pub kind: String,
    /// Vendor-specific connection parameters, passed to `Driver::open` untouched.
    #[serde(default)]
    pub connection_params: HashMap<String, toml::Value>,
}

/// Data server settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DataServerSettings {
    /// Listen address for the pub/sub hub.
    #[serde(default = "default_dataserv_addr")]
    pub listen_addr: String,
    /// Bounded queue depth per subscriber. On overflow the oldest queued
    /// record is dropped for that subscriber (drop-oldest policy): a lagging
    /// observer loses history, never freshness, and never blocks producers.
    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// Records retained per stream for explicit backlog replay. Zero disables
    /// replay.
    #[serde(default)]
    pub backlog_capacity: usize,
    /// When set, only these streams exist and publishing elsewhere fails with
    /// an unknown-stream error. When empty, streams are created on first
    /// publish.
    #[serde(default)]
    pub predeclared_streams: Vec<String>,
}

fn default_dataserv_addr() -> String {
    format!("127.0.0.1:{DEFAULT_DATASERV_PORT}")
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for DataServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_dataserv_addr(),
            subscriber_queue_capacity: default_queue_capacity(),
            backlog_capacity: 0,
            predeclared_streams: Vec::new(),
        }
    }
}

/// A tunnel to a remote instrument server. Authentication material (keys,
/// agent) is supplied by the environment, never by this file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TunnelSpec {
    /// Remote host name or address.
    pub remote_host: String,
    /// Account on the remote host.
    pub remote_user: String,
    /// Local port the forward binds on this machine.
    pub local_port: u16,
    /// Port the remote instrument server listens on.
    pub remote_port: u16,
    /// Interval between no-op heartbeat calls through the forward.
    #[serde(default = "default_heartbeat", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Bound on a single heartbeat round-trip.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Reconnect attempts before the session is declared lost.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; subsequent delays double.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_max_reconnects() -> u32 {
    5
}

fn default_backoff() -> Duration {
    Duration::from_millis(500)
}

impl Settings {
    /// Loads settings from an optional TOML file merged with `LABLINK_*`
    /// environment variables, then validates them.
    pub fn load(config_path: Option<&Path>) -> LabResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            if !path.exists() {
                return Err(LabError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("LABLINK_").split("__"))
            .extract()
            .map_err(|e| LabError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what serde enforces.
    pub fn validate(&self) -> LabResult<()> {
        let mut seen = std::collections::HashSet::new();
        for driver in &self.drivers {
            if driver.name.is_empty() {
                return Err(LabError::Configuration(
                    "driver name must not be empty".into(),
                ));
            }
            if !seen.insert(driver.name.as_str()) {
                return Err(LabError::Configuration(format!(
                    "duplicate driver name '{}'",
                    driver.name
                )));
            }
        }

        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                LabError::Configuration(format!(
                    "invalid server.listen_addr '{}': {e}",
                    self.server.listen_addr
                ))
            })?;
        self.data_server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                LabError::Configuration(format!(
                    "invalid data_server.listen_addr '{}': {e}",
                    self.data_server.listen_addr
                ))
            })?;

        if self.data_server.subscriber_queue_capacity == 0 {
            return Err(LabError::Configuration(
                "data_server.subscriber_queue_capacity must be at least 1".into(),
            ));
        }

        for tunnel in &self.tunnels {
            if tunnel.local_port == 0 || tunnel.remote_port == 0 {
                return Err(LabError::Configuration(format!(
                    "tunnel to '{}' must use nonzero ports",
                    tunnel.remote_host
                )));
            }
            if tunnel.max_reconnect_attempts == 0 {
                return Err(LabError::Configuration(format!(
                    "tunnel to '{}' needs at least one reconnect attempt",
                    tunnel.remote_host
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(
            settings.server.listen_addr,
            format!("127.0.0.1:{DEFAULT_INSERV_PORT}")
        );
        assert!(settings.drivers.is_empty());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "127.0.0.1:42001"

[[drivers]]
name = "laser"
kind = "sim_laser"
[drivers.connection_params]
host = "192.168.1.10"

[[tunnels]]
remote_host = "192.168.1.95"
remote_user = "lab"
local_port = 42067
remote_port = 42057
heartbeat_interval = "2s"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.server.listen_addr, "127.0.0.1:42001");
        assert_eq!(settings.drivers.len(), 1);
        assert_eq!(settings.drivers[0].kind, "sim_laser");
        assert_eq!(
            settings.drivers[0]
                .connection_params
                .get("host")
                .and_then(|v| v.as_str()),
            Some("192.168.1.10")
        );
        assert_eq!(
            settings.tunnels[0].heartbeat_interval,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_duplicate_driver_names_rejected() {
        let mut settings = Settings::default();
        for _ in 0..2 {
            settings.drivers.push(DriverConfig {
                name: "laser".into(),
                kind: "sim_laser".into(),
                connection_params: HashMap::new(),
            });
        }
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, LabError::Configuration(_)));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/lab.toml"))).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
