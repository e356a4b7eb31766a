use std::{sync::Arc, time::Duration};

use tokio::{
    sync::oneshot,
    task::{JoinError, JoinHandle},
    time::{Instant, sleep_until},
};
use tracing::{error, info, warn};

use crate::{
    cluster::ClusterClient,
    error::{KubedeckError, KubedeckResult},
    registry::SessionRegistry,
    session::Session,
};

/// How a tunnel ended
#[derive(Debug)]
enum Outcome {
    Stopped,
    Failed(KubedeckError),
}

/// Drives a registered session through its lifecycle
///
/// `starting → running → {stopped, error}`, or straight from `starting` to
/// a terminal status. Failed tunnels are reported, never retried. Whatever
/// the outcome, the session is removed from the registry exactly once, and
/// before its terminal status is published.
#[derive(Clone)]
pub struct TunnelEstablisher {
    cluster: Arc<dyn ClusterClient>,
    registry: SessionRegistry,
    ready_timeout: Duration,
    stop_grace: Duration,
}

impl TunnelEstablisher {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: SessionRegistry,
        ready_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            cluster,
            registry,
            ready_timeout,
            stop_grace,
        }
    }

    /// Run `session` on its own task
    pub fn spawn(&self, session: Arc<Session>) -> JoinHandle<()> {
        let establisher = self.clone();
        tokio::spawn(async move { establisher.run(session).await })
    }

    /// Establish the tunnel and wait for it to end
    pub async fn run(&self, session: Arc<Session>) {
        info!(
            "Starting port-forward for pod {}/{}: {:?}",
            session.namespace(),
            session.pod(),
            session.ports()
        );

        let outcome = self.drive(&session).await;

        // waiters on the terminal status must find the registry entry gone
        self.registry.remove(session.id()).await;

        match outcome {
            Outcome::Stopped => {
                session.mark_stopped();
                info!(
                    "Port-forward stopped for pod {}/{}",
                    session.namespace(),
                    session.pod()
                );
            }
            Outcome::Failed(e) => {
                error!(
                    "Port-forward for pod {}/{} failed: {}",
                    session.namespace(),
                    session.pod(),
                    e
                );
                session.mark_error(e.to_string());
            }
        }
    }

    async fn drive(&self, session: &Session) -> Outcome {
        let cancel = session.cancel_token();
        // the readiness window covers the upgrade as well as the listeners
        let deadline = Instant::now() + self.ready_timeout;

        let tunnel = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Stopped,
            _ = sleep_until(deadline) => return Outcome::Failed(self.not_ready()),
            opened = self.cluster.open_tunnel(session.namespace(), session.pod(), session.ports()) => {
                match opened {
                    Ok(tunnel) => tunnel,
                    Err(e) => return Outcome::Failed(e),
                }
            }
        };

        // The loop gets a child token so it can be unwound on failure
        // without touching the session's own stop signal.
        let loop_cancel = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut forwarding = tokio::spawn(tunnel.forward(ready_tx, loop_cancel.clone()));

        let startup = tokio::select! {
            ready = ready_rx => match ready {
                Ok(()) => Ok(()),
                // sender dropped without readiness: the loop is exiting, collect its result
                Err(_) => Err(closed_early(join_result((&mut forwarding).await))),
            },
            res = &mut forwarding => Err(closed_early(join_result(res))),
            _ = sleep_until(deadline) => Err(self.not_ready()),
            _ = cancel.cancelled() => {
                self.unwind(&mut forwarding).await;
                return Outcome::Stopped;
            }
        };

        if let Err(e) = startup {
            loop_cancel.cancel();
            self.unwind(&mut forwarding).await;
            return Outcome::Failed(e);
        }

        session.mark_running();
        info!(
            "Port-forward ready: {}/{} {}",
            session.namespace(),
            session.pod(),
            session.url()
        );

        tokio::select! {
            res = &mut forwarding => match join_result(res) {
                Ok(()) => Outcome::Stopped,
                Err(e) => Outcome::Failed(e),
            },
            _ = cancel.cancelled() => {
                info!(
                    "Port-forward manually stopped: {}/{}",
                    session.namespace(),
                    session.pod()
                );
                self.unwind(&mut forwarding).await;
                Outcome::Stopped
            }
        }
    }

    fn not_ready(&self) -> KubedeckError {
        KubedeckError::Timeout(format!(
            "port-forward not ready after {}s",
            self.ready_timeout.as_secs_f32()
        ))
    }

    /// Wait for a cancelled forwarding loop to exit, aborting it if it
    /// does not within the grace period
    async fn unwind(&self, forwarding: &mut JoinHandle<KubedeckResult<()>>) {
        if forwarding.is_finished() {
            return;
        }
        if tokio::time::timeout(self.stop_grace, &mut *forwarding)
            .await
            .is_err()
        {
            warn!("Forwarding loop did not stop within {:?}, aborting", self.stop_grace);
            forwarding.abort();
        }
    }
}

fn join_result(res: Result<KubedeckResult<()>, JoinError>) -> KubedeckResult<()> {
    res.map_err(|e| KubedeckError::Tunnel(format!("forwarding task failed: {e}")))?
}

/// The forwarding loop exited before reporting readiness
fn closed_early(res: KubedeckResult<()>) -> KubedeckError {
    match res {
        Ok(()) => KubedeckError::Tunnel("port-forward closed before becoming ready".to_string()),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::{
        cluster::mock::{MockCluster, TunnelBehavior},
        forwarding::PortPair,
        session::SessionStatus,
    };

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn establisher(cluster: &MockCluster, registry: &SessionRegistry) -> TunnelEstablisher {
        TunnelEstablisher::new(
            Arc::new(cluster.clone()),
            registry.clone(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
    }

    async fn registered(registry: &SessionRegistry, local_port: u16) -> Arc<Session> {
        let session = Arc::new(Session::new(
            "market",
            "web-1",
            vec![PortPair::new(local_port, 8080)],
        )
        .unwrap());
        assert!(registry.add(Arc::clone(&session)).await);
        session
    }

    #[tokio::test]
    async fn test_tunnel_runs_and_stops() {
        let cluster = MockCluster::new();
        let registry = SessionRegistry::new();
        let port = free_port().await;
        let session = registered(&registry, port).await;

        let handle = establisher(&cluster, &registry).spawn(Arc::clone(&session));
        let state = session.wait_until_settled(Duration::from_secs(2)).await;
        assert_eq!(state.status, SessionStatus::Running);
        assert!(state.started_at.is_some());

        // bytes flow through the local listener
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(registry.stop(session.id()).await);
        handle.await.unwrap();

        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(registry.get(session.id()).await.is_none());
        assert!(!registry.stop(session.id()).await);
    }

    #[tokio::test]
    async fn test_upgrade_failure_is_error() {
        let cluster = MockCluster::new();
        cluster.set_tunnel_behavior(TunnelBehavior::UpgradeFails);
        let registry = SessionRegistry::new();
        let session = registered(&registry, free_port().await).await;

        establisher(&cluster, &registry).run(Arc::clone(&session)).await;

        let state = session.state();
        assert_eq!(state.status, SessionStatus::Error);
        assert!(state.error.unwrap().contains("upgrade request rejected"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_error() {
        let cluster = MockCluster::new();
        cluster.set_tunnel_behavior(TunnelBehavior::Hang);
        let registry = SessionRegistry::new();
        let session = registered(&registry, free_port().await).await;

        establisher(&cluster, &registry).run(Arc::clone(&session)).await;

        let state = session.state();
        assert_eq!(state.status, SessionStatus::Error);
        let error = state.error.unwrap();
        assert!(error.starts_with("Operation timed out"), "{error}");
        assert!(error.contains("not ready"));
        assert!(state.started_at.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stalled_upgrade_times_out() {
        let cluster = MockCluster::new();
        cluster.set_tunnel_behavior(TunnelBehavior::UpgradeStalls);
        let registry = SessionRegistry::new();
        let session = registered(&registry, free_port().await).await;

        let handle = establisher(&cluster, &registry).spawn(Arc::clone(&session));
        let state = session.wait_until_settled(Duration::from_secs(3)).await;
        assert_eq!(state.status, SessionStatus::Error);
        assert!(state.error.unwrap().contains("not ready"));
        handle.await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_listing_while_starting() {
        let cluster = MockCluster::new();
        cluster.set_tunnel_behavior(TunnelBehavior::Hang);
        let registry = SessionRegistry::new();
        let session = registered(&registry, free_port().await).await;

        let handle = establisher(&cluster, &registry).spawn(Arc::clone(&session));
        tokio::task::yield_now().await;

        let summaries = tokio::time::timeout(Duration::from_millis(50), registry.summaries())
            .await
            .expect("listing blocked on a starting session");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, SessionStatus::Starting);

        registry.stop(session.id()).await;
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stopped_session_is_gone_once_terminal() {
        let cluster = MockCluster::new();
        let registry = SessionRegistry::new();
        let establisher = establisher(&cluster, &registry);

        for _ in 0..50 {
            let session = registered(&registry, free_port().await).await;
            let handle = establisher.spawn(Arc::clone(&session));
            assert_eq!(
                session.wait_until_settled(Duration::from_secs(2)).await.status,
                SessionStatus::Running
            );

            assert!(registry.stop(session.id()).await);
            let state = session.wait_until_terminal(Duration::from_secs(2)).await;
            assert_eq!(state.status, SessionStatus::Stopped);
            assert!(!registry.stop(session.id()).await);
            assert!(registry.get(session.id()).await.is_none());
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let cluster = MockCluster::new();
        let registry = SessionRegistry::new();
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let session = registered(&registry, port).await;

        establisher(&cluster, &registry).run(Arc::clone(&session)).await;

        let state = session.state();
        assert_eq!(state.status, SessionStatus::Error);
        assert!(state.error.unwrap().contains(&port.to_string()));
    }

    #[tokio::test]
    async fn test_second_tunnel_on_same_port_fails() {
        let cluster = MockCluster::new();
        let registry = SessionRegistry::new();
        let port = free_port().await;
        let establisher = establisher(&cluster, &registry);

        let first = registered(&registry, port).await;
        let first_handle = establisher.spawn(Arc::clone(&first));
        assert_eq!(
            first.wait_until_settled(Duration::from_secs(2)).await.status,
            SessionStatus::Running
        );

        let second = Arc::new(Session::new(
            "market",
            "web-2",
            vec![PortPair::new(port, 9090)],
        )
        .unwrap());
        registry.add(Arc::clone(&second)).await;
        establisher.run(Arc::clone(&second)).await;
        assert_eq!(second.status(), SessionStatus::Error);
        assert_eq!(first.status(), SessionStatus::Running);

        registry.stop(first.id()).await;
        first_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_after_running_is_error() {
        let cluster = MockCluster::new();
        cluster.set_tunnel_behavior(TunnelBehavior::FailAfterReady(Duration::from_millis(50)));
        let registry = SessionRegistry::new();
        let session = registered(&registry, free_port().await).await;

        let handle = establisher(&cluster, &registry).spawn(Arc::clone(&session));
        assert_eq!(
            session.wait_until_settled(Duration::from_secs(2)).await.status,
            SessionStatus::Running
        );
        handle.await.unwrap();

        let state = session.state();
        assert_eq!(state.status, SessionStatus::Error);
        assert!(state.started_at.is_some());
        assert_eq!(state.error.as_deref(), Some("Tunnel error: lost connection to pod"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stop_while_starting() {
        let cluster = MockCluster::new();
        cluster.set_tunnel_behavior(TunnelBehavior::Hang);
        let registry = SessionRegistry::new();
        let session = registered(&registry, free_port().await).await;

        let handle = establisher(&cluster, &registry).spawn(Arc::clone(&session));
        registry.stop(session.id()).await;
        handle.await.unwrap();

        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(registry.is_empty().await);
    }
}
