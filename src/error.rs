use thiserror::Error;

/// Result type alias for kubedeck operations
pub type KubedeckResult<T> = std::result::Result<T, KubedeckError>;

/// Error types for the kubedeck library
#[derive(Error, Debug)]
pub enum KubedeckError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control-plane credentials could not be resolved
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Errors returned by the Kubernetes API
    #[error("Kubernetes API error: {0}")]
    Kube(String),

    /// The target pod does not exist
    #[error("Pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    /// Protocol upgrade to the pod forwarding endpoint failed
    #[error("Upgrade error: {0}")]
    Upgrade(String),

    /// A local listener could not be bound
    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Tunnel management errors
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Log or watch stream errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Writes or pings to a client connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl KubedeckError {
    /// Whether this error means the target pod is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubedeckError::PodNotFound { .. })
    }
}

impl From<kube::Error> for KubedeckError {
    fn from(err: kube::Error) -> Self {
        KubedeckError::Kube(err.to_string())
    }
}

impl From<config::ConfigError> for KubedeckError {
    fn from(err: config::ConfigError) -> Self {
        KubedeckError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KubedeckError::PodNotFound {
            namespace: "market".to_string(),
            name: "web-1".to_string(),
        };
        assert_eq!(err.to_string(), "Pod market/web-1 not found");
        assert!(err.is_not_found());

        let err = KubedeckError::Bind {
            port: 18080,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("Failed to bind local port 18080"));
        assert!(!err.is_not_found());
    }
}
