use std::{net::IpAddr, path::Path, time::Duration};

use config::{Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{KubedeckError, KubedeckResult};

/// Prefix for environment overrides, e.g. `KUBEDECK__SERVER__PORT=9090`
const ENV_PREFIX: &str = "KUBEDECK";

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Kubernetes client settings
    pub kube: KubeConfig,
    /// Port-forward tunnel settings
    pub tunnel: TunnelConfig,
    /// Log streaming settings
    pub logs: LogsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allow cross-origin requests from any origin
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors: true,
        }
    }
}

/// Kubernetes client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// Path to a kubeconfig file. Falls back to in-cluster config, then
    /// `KUBECONFIG`, then `~/.kube/config`.
    pub kubeconfig: Option<String>,
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
}

/// Port-forward tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// How long a tunnel may take to report readiness
    pub ready_timeout_secs: u64,
    /// Connect timeout used when probing local ports
    pub probe_timeout_ms: u64,
    /// Local address tunnels listen on
    pub bind_address: String,
    /// How long a cancelled forwarding loop may take to unwind
    pub stop_grace_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 10,
            probe_timeout_ms: 1000,
            bind_address: "127.0.0.1".to_string(),
            stop_grace_secs: 5,
        }
    }
}

impl TunnelConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Log streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Tail line count used when the client does not pass one
    pub default_tail_lines: i64,
    /// Outgoing queue size used when the client does not pass one
    pub default_buffer_size: usize,
    /// Upper bound on a single log read before checking for idleness
    pub read_timeout_ms: u64,
    /// Idle time in follow mode before a keep-alive is sent
    pub keepalive_secs: u64,
    /// Pause before reconnecting a follow stream that ended
    pub reconnect_delay_secs: u64,
    /// How long a client may leave one outgoing frame unaccepted
    pub write_timeout_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            default_tail_lines: 100,
            default_buffer_size: 100,
            read_timeout_ms: 1000,
            keepalive_secs: 30,
            reconnect_delay_secs: 2,
            write_timeout_secs: 10,
        }
    }
}

impl LogsConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and the environment
    ///
    /// Sources are layered in that order. `PORT` and `KUBECONFIG` are also
    /// honored for compatibility with the usual container conventions.
    pub fn load(path: Option<&Path>) -> KubedeckResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(KubedeckError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        if let Ok(port) = std::env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }
        if let Ok(kubeconfig) = std::env::var("KUBECONFIG")
            && !kubeconfig.is_empty()
        {
            builder = builder.set_default("kube.kubeconfig", kubeconfig)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> KubedeckResult<()> {
        if self.server.port == 0 {
            return Err(KubedeckError::Config("Server port cannot be 0".to_string()));
        }

        self.server.host.parse::<IpAddr>().map_err(|_| {
            KubedeckError::Config(format!("Invalid server host '{}'", self.server.host))
        })?;

        self.tunnel.bind_address.parse::<IpAddr>().map_err(|_| {
            KubedeckError::Config(format!(
                "Invalid tunnel bind address '{}'",
                self.tunnel.bind_address
            ))
        })?;

        if self.tunnel.ready_timeout_secs == 0 {
            return Err(KubedeckError::Config(
                "Tunnel ready timeout must be at least 1 second".to_string(),
            ));
        }

        if self.logs.default_tail_lines < 0 {
            return Err(KubedeckError::Config(
                "Default tail lines cannot be negative".to_string(),
            ));
        }

        if self.logs.default_buffer_size == 0 {
            return Err(KubedeckError::Config(
                "Default buffer size must be at least 1".to_string(),
            ));
        }

        if self.logs.read_timeout_ms == 0 {
            return Err(KubedeckError::Config("Log read timeout cannot be 0".to_string()));
        }

        if self.logs.write_timeout_secs == 0 {
            return Err(KubedeckError::Config(
                "Client write timeout must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string the HTTP server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
