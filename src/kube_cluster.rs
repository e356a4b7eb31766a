use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{LogParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    cluster::{ClusterClient, LogLines, LogRequest, PodEvent, PodEventKind, PodEvents, Tunnel},
    config::KubeConfig,
    error::{KubedeckError, KubedeckResult},
    forwarding::PortPair,
};

/// Production control-plane client backed by the kube crate
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    bind_address: IpAddr,
}

impl KubeCluster {
    /// Resolve credentials and build a client
    ///
    /// An explicit kubeconfig path or context wins; otherwise the
    /// configuration is inferred from `KUBECONFIG`, `~/.kube/config` or the
    /// in-cluster service account.
    pub async fn connect(config: &KubeConfig, bind_address: IpAddr) -> KubedeckResult<Self> {
        let options = KubeConfigOptions {
            context: config.context.clone(),
            ..Default::default()
        };

        let client_config = match (&config.kubeconfig, &config.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    KubedeckError::Credentials(format!("Failed to read kubeconfig {path}: {e}"))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| KubedeckError::Credentials(e.to_string()))?
            }
            (None, Some(_)) => kube::Config::from_kubeconfig(&options)
                .await
                .map_err(|e| KubedeckError::Credentials(e.to_string()))?,
            (None, None) => kube::Config::infer()
                .await
                .map_err(|e| KubedeckError::Credentials(e.to_string()))?,
        };

        info!(cluster_url = %client_config.cluster_url, "Kubernetes client configured");
        let client = Client::try_from(client_config)?;

        Ok(Self {
            client,
            bind_address,
        })
    }

    /// Check that the API server answers, returning its version
    pub async fn check_connection(&self) -> KubedeckResult<String> {
        let version = self.client.apiserver_version().await?;
        Ok(version.git_version)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error on a pod request to the crate error
fn pod_error(err: kube::Error, namespace: &str, name: &str) -> KubedeckError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => KubedeckError::PodNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ref resp) if resp.code == 401 || resp.code == 403 => {
            KubedeckError::Credentials(resp.message.clone())
        }
        other => other.into(),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> KubedeckResult<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| pod_error(e, namespace, name))
    }

    #[instrument(skip(self, request), fields(container = ?request.container))]
    async fn stream_logs(
        &self,
        namespace: &str,
        name: &str,
        request: &LogRequest,
    ) -> KubedeckResult<LogLines> {
        let lp = LogParams {
            container: request.container.clone(),
            follow: request.follow,
            tail_lines: request.tail_lines,
            timestamps: request.timestamps,
            ..Default::default()
        };

        let reader = self
            .pods(namespace)
            .log_stream(name, &lp)
            .await
            .map_err(|e| match pod_error(e, namespace, name) {
                KubedeckError::Kube(message) => KubedeckError::Stream(message),
                other => other,
            })?;

        Ok(reader.lines().boxed())
    }

    async fn watch_pods(&self, namespace: &str) -> KubedeckResult<PodEvents> {
        let events = self
            .pods(namespace)
            .watch(&WatchParams::default(), "0")
            .await
            .map_err(|e| KubedeckError::Stream(format!("Failed to create pod watcher: {e}")))?;

        let mapped = events.filter_map(|event| async move {
            match event {
                Ok(WatchEvent::Added(pod)) => Some(Ok(changed(PodEventKind::Added, pod))),
                Ok(WatchEvent::Modified(pod)) => Some(Ok(changed(PodEventKind::Modified, pod))),
                Ok(WatchEvent::Deleted(pod)) => Some(Ok(changed(PodEventKind::Deleted, pod))),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(resp)) => Some(Ok(PodEvent::Error(resp.message))),
                Err(e) => Some(Err(KubedeckError::Stream(e.to_string()))),
            }
        });

        Ok(mapped.boxed())
    }

    #[instrument(skip(self, ports), fields(ports = ports.len()))]
    async fn open_tunnel(
        &self,
        namespace: &str,
        name: &str,
        ports: &[PortPair],
    ) -> KubedeckResult<Box<dyn Tunnel>> {
        let pods = self.pods(namespace);
        let remote_ports: Vec<u16> = ports.iter().map(|p| p.remote_port).collect();

        // Negotiate the upgrade once before binding anything locally, so an
        // unreachable forwarding endpoint fails the session up front.
        let handshake = pods
            .portforward(name, &remote_ports)
            .await
            .map_err(|e| match pod_error(e, namespace, name) {
                KubedeckError::Kube(message) => KubedeckError::Upgrade(message),
                other => other,
            })?;
        handshake.abort();
        debug!("Port-forward upgrade negotiated");

        Ok(Box::new(KubeTunnel {
            pods,
            namespace: namespace.to_string(),
            pod: name.to_string(),
            ports: ports.to_vec(),
            bind_address: self.bind_address,
        }))
    }
}

fn changed(kind: PodEventKind, pod: Pod) -> PodEvent {
    PodEvent::Changed {
        kind,
        pod: Box::new(pod),
    }
}

/// Forwarding loop over the pod's `portforward` subresource
///
/// Every accepted local connection gets its own upgraded stream. The tunnel
/// ends when it is cancelled, a listener fails, or the pod disappears.
struct KubeTunnel {
    pods: Api<Pod>,
    namespace: String,
    pod: String,
    ports: Vec<PortPair>,
    bind_address: IpAddr,
}

#[async_trait]
impl Tunnel for KubeTunnel {
    async fn forward(
        self: Box<Self>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> KubedeckResult<()> {
        let mut listeners = Vec::with_capacity(self.ports.len());
        for pair in &self.ports {
            let addr = SocketAddr::new(self.bind_address, pair.local_port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| KubedeckError::Bind {
                    port: pair.local_port,
                    source,
                })?;
            listeners.push((listener, pair.remote_port));
        }

        let _ = ready.send(());
        info!(
            "Forwarding {}/{} on {} port(s)",
            self.namespace,
            self.pod,
            self.ports.len()
        );

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<KubedeckError>(1);
        let mut accept_loops = JoinSet::new();
        for (listener, remote_port) in listeners {
            accept_loops.spawn(accept_loop(
                Target {
                    pods: self.pods.clone(),
                    namespace: self.namespace.clone(),
                    pod: self.pod.clone(),
                    remote_port,
                },
                listener,
                fatal_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(fatal_tx);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            Some(err) = fatal_rx.recv() => Err(err),
            Some(res) = accept_loops.join_next() => match res {
                Ok(r) => r,
                Err(e) => Err(KubedeckError::Tunnel(format!("accept loop failed: {e}"))),
            },
        };

        cancel.cancel();
        accept_loops.shutdown().await;
        outcome
    }
}

/// Where accepted connections are forwarded to
#[derive(Clone)]
struct Target {
    pods: Api<Pod>,
    namespace: String,
    pod: String,
    remote_port: u16,
}

async fn accept_loop(
    target: Target,
    listener: TcpListener,
    fatal: mpsc::Sender<KubedeckError>,
    cancel: CancellationToken,
) -> KubedeckResult<()> {
    let local = listener.local_addr()?;

    loop {
        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.map_err(|e| {
                KubedeckError::Tunnel(format!("Listener on {local} failed: {e}"))
            })?,
        };
        debug!(%peer, %local, "Accepted connection");

        let target = target.clone();
        let fatal = fatal.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = forward_connection(&target, conn) => {
                    if let Err(e) = res {
                        warn!(%peer, "Forwarded connection failed: {}", e);
                        // a missing pod ends the whole tunnel, anything else only this connection
                        if target.pods.get_opt(&target.pod).await.ok().flatten().is_none() {
                            let _ = fatal.try_send(KubedeckError::Tunnel(format!(
                                "lost connection to pod {}/{}",
                                target.namespace, target.pod
                            )));
                        }
                    }
                }
            }
        });
    }
}

async fn forward_connection(target: &Target, mut client_conn: TcpStream) -> KubedeckResult<()> {
    let port = target.remote_port;
    let mut forwarder = target
        .pods
        .portforward(&target.pod, &[port])
        .await
        .map_err(|e| KubedeckError::Upgrade(e.to_string()))?;

    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| KubedeckError::Tunnel(format!("port {port} not found in forwarder")))?;

    tokio::io::copy_bidirectional(&mut client_conn, &mut upstream).await?;
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| KubedeckError::Tunnel(e.to_string()))
}
