//! Control-plane client abstraction.
//!
//! The tunnel and streaming code only talks to Kubernetes through
//! [`ClusterClient`], which keeps the concurrency logic testable without a
//! cluster. [`KubeCluster`](crate::kube_cluster::KubeCluster) is the
//! production implementation.

use std::{fmt, io};

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{error::KubedeckResult, forwarding::PortPair};

/// Stream of log lines, without trailing newlines
pub type LogLines = BoxStream<'static, io::Result<String>>;

/// Stream of pod lifecycle notifications
pub type PodEvents = BoxStream<'static, KubedeckResult<PodEvent>>;

/// Parameters of a log read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    /// Container to read; `None` lets the API server pick
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
    pub follow: bool,
    pub timestamps: bool,
}

/// Kind of a pod change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

impl PodEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodEventKind::Added => "ADDED",
            PodEventKind::Modified => "MODIFIED",
            PodEventKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for PodEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pod change notification
#[derive(Debug, Clone)]
pub enum PodEvent {
    Changed { kind: PodEventKind, pod: Box<Pod> },
    /// The watch reported an error but is still open
    Error(String),
}

/// An upgraded forwarding connection to a pod, ready to start forwarding
#[async_trait]
pub trait Tunnel: Send {
    /// Run the forwarding loop
    ///
    /// Fires `ready` once every local listener is bound. Blocks until
    /// `cancel` fires (returning `Ok`) or the forwarding fails.
    async fn forward(
        self: Box<Self>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> KubedeckResult<()>;
}

/// Operations the core needs from the control plane
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a pod by name
    async fn get_pod(&self, namespace: &str, name: &str) -> KubedeckResult<Pod>;

    /// Open a line stream over a pod's container logs
    async fn stream_logs(&self, namespace: &str, name: &str, request: &LogRequest)
    -> KubedeckResult<LogLines>;

    /// Subscribe to pod change notifications in a namespace
    async fn watch_pods(&self, namespace: &str) -> KubedeckResult<PodEvents>;

    /// Negotiate a forwarding connection for the given port pairs
    async fn open_tunnel(
        &self,
        namespace: &str,
        name: &str,
        ports: &[PortPair],
    ) -> KubedeckResult<Box<dyn Tunnel>>;
}

/// Phase of a pod, `Unknown` when the status is missing
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

/// Node the pod is scheduled on, empty when unscheduled
pub fn pod_node(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or("")
}

/// Name of the pod's first container
pub fn first_container(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.as_str())
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory [`ClusterClient`] used by the unit tests.

    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use futures::StreamExt;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::error::KubedeckError;

    pub fn pod(namespace: &str, name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    /// What the next opened tunnel does
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TunnelBehavior {
        /// Bind real listeners and echo bytes back
        Echo,
        /// Fail before the upgrade completes
        UpgradeFails,
        /// Never complete the upgrade
        UpgradeStalls,
        /// Never report readiness
        Hang,
        /// Report readiness, then fail after the given delay
        FailAfterReady(Duration),
    }

    /// A scripted log response; the stream ends after the last item
    pub type LogScript = Vec<io::Result<String>>;

    #[derive(Default)]
    struct State {
        pods: HashMap<(String, String), Pod>,
        logs: Vec<LogScript>,
        log_requests: Vec<LogRequest>,
        reject_named_container: bool,
        follow_tail_forever: bool,
        events: Vec<KubedeckResult<PodEvent>>,
    }

    #[derive(Clone)]
    pub struct MockCluster {
        state: Arc<Mutex<State>>,
        behavior: Arc<Mutex<TunnelBehavior>>,
    }

    impl MockCluster {
        pub fn new() -> Self {
            Self {
                state: Arc::default(),
                behavior: Arc::new(Mutex::new(TunnelBehavior::Echo)),
            }
        }

        pub fn with_pod(self, namespace: &str, name: &str, phase: &str) -> Self {
            self.insert_pod(pod(namespace, name, phase));
            self
        }

        pub fn insert_pod(&self, pod: Pod) {
            let key = (
                pod.metadata.namespace.clone().unwrap_or_default(),
                pod.metadata.name.clone().unwrap_or_default(),
            );
            self.state.lock().unwrap().pods.insert(key, pod);
        }

        pub fn remove_pod(&self, namespace: &str, name: &str) {
            self.state
                .lock()
                .unwrap()
                .pods
                .remove(&(namespace.to_string(), name.to_string()));
        }

        /// Queue the lines returned by the next log read
        pub fn push_logs(&self, lines: LogScript) {
            self.state.lock().unwrap().logs.push(lines);
        }

        /// Keep log streams open (pending) after their scripted lines
        pub fn hold_log_streams_open(&self) {
            self.state.lock().unwrap().follow_tail_forever = true;
        }

        /// Make log reads that name a container fail
        pub fn reject_named_container(&self) {
            self.state.lock().unwrap().reject_named_container = true;
        }

        pub fn log_requests(&self) -> Vec<LogRequest> {
            self.state.lock().unwrap().log_requests.clone()
        }

        pub fn push_event(&self, event: KubedeckResult<PodEvent>) {
            self.state.lock().unwrap().events.push(event);
        }

        pub fn set_tunnel_behavior(&self, behavior: TunnelBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }
    }

    #[async_trait]
    impl ClusterClient for MockCluster {
        async fn get_pod(&self, namespace: &str, name: &str) -> KubedeckResult<Pod> {
            self.state
                .lock()
                .unwrap()
                .pods
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| KubedeckError::PodNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
        }

        async fn stream_logs(
            &self,
            namespace: &str,
            name: &str,
            request: &LogRequest,
        ) -> KubedeckResult<LogLines> {
            let mut state = self.state.lock().unwrap();
            state.log_requests.push(request.clone());

            if !state
                .pods
                .contains_key(&(namespace.to_string(), name.to_string()))
            {
                return Err(KubedeckError::PodNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
            if state.reject_named_container && request.container.is_some() {
                return Err(KubedeckError::Stream("container name rejected".to_string()));
            }

            let lines = if state.logs.is_empty() {
                Vec::new()
            } else {
                state.logs.remove(0)
            };
            let stream = futures::stream::iter(lines);
            if state.follow_tail_forever {
                Ok(stream.chain(futures::stream::pending()).boxed())
            } else {
                Ok(stream.boxed())
            }
        }

        async fn watch_pods(&self, _namespace: &str) -> KubedeckResult<PodEvents> {
            let events = std::mem::take(&mut self.state.lock().unwrap().events);
            Ok(futures::stream::iter(events).boxed())
        }

        async fn open_tunnel(
            &self,
            _namespace: &str,
            _name: &str,
            ports: &[PortPair],
        ) -> KubedeckResult<Box<dyn Tunnel>> {
            let behavior = *self.behavior.lock().unwrap();
            match behavior {
                TunnelBehavior::UpgradeFails => {
                    return Err(KubedeckError::Upgrade("upgrade request rejected".to_string()));
                }
                TunnelBehavior::UpgradeStalls => futures::future::pending::<()>().await,
                _ => {}
            }
            Ok(Box::new(MockTunnel {
                ports: ports.to_vec(),
                behavior,
            }))
        }
    }

    struct MockTunnel {
        ports: Vec<PortPair>,
        behavior: TunnelBehavior,
    }

    #[async_trait]
    impl Tunnel for MockTunnel {
        async fn forward(
            self: Box<Self>,
            ready: oneshot::Sender<()>,
            cancel: CancellationToken,
        ) -> KubedeckResult<()> {
            if self.behavior == TunnelBehavior::Hang {
                cancel.cancelled().await;
                return Ok(());
            }

            let mut listeners = Vec::new();
            for pair in &self.ports {
                let listener = TcpListener::bind(("127.0.0.1", pair.local_port))
                    .await
                    .map_err(|source| KubedeckError::Bind {
                        port: pair.local_port,
                        source,
                    })?;
                listeners.push(listener);
            }
            let _ = ready.send(());

            match self.behavior {
                TunnelBehavior::FailAfterReady(delay) => tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(delay) => {
                        Err(KubedeckError::Tunnel("lost connection to pod".to_string()))
                    }
                },
                _ => tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    res = echo(&listeners[0]) => res,
                },
            }
        }
    }

    async fn echo(listener: &TcpListener) -> KubedeckResult<()> {
        loop {
            let (mut conn, _) = listener.accept().await?;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}
