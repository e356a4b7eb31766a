use std::time::Duration;

use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

/// Local port availability prober
///
/// The answer is advisory: another process may bind the port between the
/// probe and the tunnel's own bind. That case surfaces later as a tunnel
/// error.
#[derive(Debug, Clone)]
pub struct PortProber {
    /// Connection timeout for probes
    timeout: Duration,
}

impl Default for PortProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl PortProber {
    /// Create a new prober with the specified connect timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Check whether something accepts connections on `localhost:port`
    pub async fn is_port_in_use(&self, port: u16) -> bool {
        let address = format!("localhost:{port}");

        match timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => {
                debug!("Port {} is in use", port);
                true
            }
            Ok(Err(e)) => {
                debug!("Port {} is free: {}", port, e);
                false
            }
            Err(_) => {
                debug!("Probe of port {} timed out, treating as free", port);
                false
            }
        }
    }
}
