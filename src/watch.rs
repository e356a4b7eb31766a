use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cluster::{ClusterClient, PodEvent, pod_phase},
    error::KubedeckResult,
    relay::{ClientConnection, RelayMessage, until_cancelled},
};

/// Relay pod lifecycle events of `namespace` until the watch ends or the
/// client goes away
///
/// Returns the connection so the caller can close it.
pub async fn watch_pods<C: ClientConnection>(
    cluster: Arc<dyn ClusterClient>,
    namespace: &str,
    cancel: CancellationToken,
    mut connection: C,
) -> C {
    info!("Pod watch started: {}", namespace);
    if let Err(e) = relay_events(cluster.as_ref(), namespace, &cancel, &mut connection).await {
        warn!("Pod watch for {} ended with error: {}", namespace, e);
    }
    info!("Pod watch stopped: {}", namespace);
    connection
}

async fn relay_events<C: ClientConnection>(
    cluster: &dyn ClusterClient,
    namespace: &str,
    cancel: &CancellationToken,
    connection: &mut C,
) -> KubedeckResult<()> {
    let started = RelayMessage::info(format!("Started watching pods in namespace: {namespace}"));
    until_cancelled(cancel, connection.send(started)).await?;

    let mut events = match cluster.watch_pods(namespace).await {
        Ok(events) => events,
        Err(e) => {
            until_cancelled(cancel, connection.send(RelayMessage::error(e.to_string()))).await?;
            return Err(e);
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            event = events.next() => event,
        };

        let message = match event {
            None => {
                let closed = RelayMessage::warning("Pod watch channel closed");
                until_cancelled(cancel, connection.send(closed)).await?;
                return Ok(());
            }
            Some(Ok(PodEvent::Changed { kind, pod })) => {
                let name = pod.metadata.name.clone().unwrap_or_default();
                let pod_namespace = pod.metadata.namespace.clone().unwrap_or_default();
                let status = pod_phase(&pod).to_string();
                RelayMessage::info(format!("{kind} pod {pod_namespace}/{name} ({status})"))
                    .with_data(json!({
                        "type": kind.as_str(),
                        "pod": name,
                        "namespace": pod_namespace,
                        "status": status,
                        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                        "object": pod,
                    }))
            }
            Some(Ok(PodEvent::Error(message))) => {
                RelayMessage::warning(format!("Pod watch error: {message}"))
            }
            Some(Err(e)) => {
                let failed = RelayMessage::error(format!("Pod watch failed: {e}"));
                until_cancelled(cancel, connection.send(failed)).await?;
                return Err(e);
            }
        };

        until_cancelled(cancel, connection.send(message)).await?;
    }
}
