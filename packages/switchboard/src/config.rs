use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / switchboard.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   switchboard.toml:  [server]
//                      port = 9000
//
//   env var:           SWITCHBOARD_SERVER__PORT=9000   (double underscore = nesting)
//
//   CLI flag:          switchboard serve --port 9000   (host and port only)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Listener and connection knobs (lives under `[server]` in switchboard.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Worker pool size: connections served at once.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// 0 disables the handshake timeout.
    #[serde(default)]
    pub handshake_timeout_secs: u64,
    /// Outbound frames queued per connection before it counts as stalled.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_max_frame_mb")]
    pub max_frame_mb: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            handshake_timeout_secs: 0,
            send_queue_capacity: default_send_queue_capacity(),
            max_frame_mb: default_max_frame_mb(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8888
}
fn default_max_connections() -> usize {
    100
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_send_queue_capacity() -> usize {
    1024
}
fn default_max_frame_mb() -> usize {
    64
}

/// Build a figment that layers: defaults → config file → SWITCHBOARD_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
///
/// Env vars use double-underscore for nesting into sections:
///   `SWITCHBOARD_SERVER__PORT=9000`  →  `server.port = 9000`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("SWITCHBOARD_").split("__"))
}

/// Values given on the command line. They sit above every figment layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl FileConfig {
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to the listener)
// =============================================================================

/// Server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Never below 1.
    pub max_connections: usize,
    pub shutdown_grace: Duration,
    pub handshake_timeout: Option<Duration>,
    /// Never below 1.
    pub send_queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            max_connections: fc.max_connections.max(1),
            shutdown_grace: Duration::from_secs(fc.shutdown_grace_secs),
            handshake_timeout: if fc.handshake_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.handshake_timeout_secs))
            },
            send_queue_capacity: fc.send_queue_capacity.max(1),
            max_frame_bytes: fc.max_frame_mb.max(1) * 1024 * 1024,
        }
    }

    /// `host:port`, as handed to `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(&ServerFileConfig::default())
    }
}
