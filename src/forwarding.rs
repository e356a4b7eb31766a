use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KubedeckError, KubedeckResult};

/// A `local:remote` port binding carried by a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPair {
    /// Port bound on the local machine
    pub local_port: u16,
    /// Container port inside the pod
    pub remote_port: u16,
}

impl PortPair {
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
        }
    }

    /// Parse a forwarding specification string
    ///
    /// Supported formats:
    /// - "local:remote" (e.g., "18080:8080")
    /// - "port" (e.g., "8080"), forwarding the same port number
    pub fn parse(spec: &str) -> KubedeckResult<Self> {
        let (local, remote) = match spec.split_once(':') {
            Some((local, remote)) => (local, remote),
            None => (spec, spec),
        };

        let local_port = parse_port(local, "local", spec)?;
        let remote_port = parse_port(remote, "remote", spec)?;

        Ok(Self::new(local_port, remote_port))
    }

    /// Parse a comma separated list of specifications
    pub fn parse_list(specs: &str) -> KubedeckResult<Vec<Self>> {
        let pairs = specs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect::<KubedeckResult<Vec<_>>>()?;

        if pairs.is_empty() {
            return Err(KubedeckError::Config("Port list cannot be empty".to_string()));
        }

        Ok(pairs)
    }
}

fn parse_port(value: &str, which: &str, spec: &str) -> KubedeckResult<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(KubedeckError::Config(format!(
            "Invalid {which} port '{value}' in forwarding specification '{spec}'"
        ))),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_port)
    }
}
