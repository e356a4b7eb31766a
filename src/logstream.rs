//! Live pod log streaming.
//!
//! A [`LogStreamController`] tails one pod's logs onto one client
//! connection. In follow mode it survives pod restarts by reconnecting in a
//! loop; in one-shot mode it ends after the available lines.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::{
    sync::RwLock,
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cluster::{ClusterClient, LogLines, LogRequest, first_container, pod_node, pod_phase},
    config::LogsConfig,
    error::{KubedeckError, KubedeckResult},
    relay::{ClientConnection, RelayMessage, until_cancelled},
};

/// Client-selected parameters of a log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStreamOptions {
    pub tail_lines: i64,
    pub follow: bool,
    /// Capacity of the outgoing message queue
    pub buffer_size: usize,
}

/// Timing knobs of the controller
#[derive(Debug, Clone, Copy)]
pub struct StreamTimings {
    /// Upper bound on one read; doubles as the cancellation check interval
    pub read_timeout: Duration,
    /// Follow-mode idle time before a keep-alive
    pub keepalive: Duration,
    /// Pause before reconnecting an ended follow stream
    pub reconnect_delay: Duration,
}

impl From<&LogsConfig> for StreamTimings {
    fn from(config: &LogsConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            keepalive: Duration::from_secs(config.keepalive_secs),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
        }
    }
}

/// How one pass over the log stream ended
enum Pass {
    /// The source hit end-of-stream
    Ended,
    /// The controller must stop
    Done,
}

pub struct LogStreamController<C> {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    pod: String,
    options: LogStreamOptions,
    timings: StreamTimings,
    cancel: CancellationToken,
    connection: C,
}

impl<C: ClientConnection> LogStreamController<C> {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: &str,
        pod: &str,
        options: LogStreamOptions,
        timings: StreamTimings,
        cancel: CancellationToken,
        connection: C,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            options,
            timings,
            cancel,
            connection,
        }
    }

    /// Stream until completion, cancellation or a terminal error
    ///
    /// Returns the connection so the caller can close it.
    pub async fn run(mut self) -> C {
        info!(
            "Log stream started: {}/{} (follow: {}, tail: {})",
            self.namespace, self.pod, self.options.follow, self.options.tail_lines
        );

        let started = self
            .send(RelayMessage::info(format!(
                "Log stream started for pod {}/{}",
                self.namespace, self.pod
            )))
            .await;

        if started.is_ok()
            && let Err(e) = self.stream_loop().await
        {
            debug!("Log stream {}/{} ended with error: {}", self.namespace, self.pod, e);
        }

        info!("Log stream stopped: {}/{}", self.namespace, self.pod);
        self.connection
    }

    async fn stream_loop(&mut self) -> KubedeckResult<()> {
        let mut reconnecting = false;

        loop {
            if self.cancel.is_cancelled() {
                return self.stopped_by_user().await;
            }

            match self.open(reconnecting).await? {
                Some(lines) => match self.pump(lines).await? {
                    Pass::Done => return Ok(()),
                    Pass::Ended if self.options.follow => {
                        self.send(RelayMessage::warning(
                            "Pod logs ended (pod might have restarted). Trying to reconnect...",
                        ))
                        .await?;
                    }
                    Pass::Ended => {
                        self.send(RelayMessage::info("Log stream completed")).await?;
                        return Ok(());
                    }
                },
                // reconnect attempt failed, already reported
                None => {}
            }

            reconnecting = true;
            tokio::select! {
                _ = self.cancel.cancelled() => return self.stopped_by_user().await,
                _ = sleep(self.timings.reconnect_delay) => {}
            }
        }
    }

    /// Resolve the pod and open its log stream
    ///
    /// Failures end the stream on the first attempt. While reconnecting a
    /// follow stream they are reported as warnings and `None` is returned so
    /// the caller retries.
    async fn open(&mut self, reconnecting: bool) -> KubedeckResult<Option<LogLines>> {
        let pod = match self.cluster.get_pod(&self.namespace, &self.pod).await {
            Ok(pod) => pod,
            Err(e) => {
                let message = format!("Pod not found: {e}");
                return self.open_failed(reconnecting, message, e).await;
            }
        };

        self.send(RelayMessage::info(format!(
            "Pod: {}, Status: {}, Node: {}",
            self.pod,
            pod_phase(&pod),
            pod_node(&pod)
        )))
        .await?;

        let mut request = LogRequest {
            container: first_container(&pod).map(str::to_string),
            tail_lines: Some(self.options.tail_lines),
            follow: self.options.follow,
            timestamps: true,
        };
        debug!(
            "Requesting logs for pod {}/{}, container: {:?}",
            self.namespace, self.pod, request.container
        );

        let opened = match self
            .cluster
            .stream_logs(&self.namespace, &self.pod, &request)
            .await
        {
            Err(e) if request.container.is_some() => {
                warn!("Failed to get log stream ({}), trying without container name", e);
                request.container = None;
                self.cluster
                    .stream_logs(&self.namespace, &self.pod, &request)
                    .await
                    .map_err(|_| e)
            }
            other => other,
        };

        match opened {
            Ok(lines) => {
                self.send(RelayMessage::info("Successfully connected to pod logs"))
                    .await?;
                Ok(Some(lines))
            }
            Err(e) => {
                let message = format!("Failed to get log stream: {e}");
                self.open_failed(reconnecting, message, e).await
            }
        }
    }

    async fn open_failed(
        &mut self,
        reconnecting: bool,
        message: String,
        cause: KubedeckError,
    ) -> KubedeckResult<Option<LogLines>> {
        if reconnecting {
            self.send(RelayMessage::warning(format!("{message}. Retrying...")))
                .await?;
            return Ok(None);
        }
        self.send(RelayMessage::error(message)).await?;
        Err(cause)
    }

    /// Relay lines until end-of-stream, cancellation or failure
    async fn pump(&mut self, mut lines: LogLines) -> KubedeckResult<Pass> {
        let mut last_data = Instant::now();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.stopped_by_user().await?;
                    return Ok(Pass::Done);
                }
                next = timeout(self.timings.read_timeout, lines.next()) => next,
            };

            match next {
                Ok(Some(Ok(line))) => {
                    last_data = Instant::now();
                    self.send(RelayMessage::log(line)).await?;
                }
                Ok(Some(Err(e))) => {
                    warn!("Error reading logs for {}/{}: {}", self.namespace, self.pod, e);
                    self.send(RelayMessage::error(format!("Error reading logs: {e}")))
                        .await?;
                    return Err(KubedeckError::Stream(e.to_string()));
                }
                Ok(None) => return Ok(Pass::Ended),
                Err(_) => {
                    if self.options.follow && last_data.elapsed() >= self.timings.keepalive {
                        self.keep_alive().await?;
                        last_data = Instant::now();
                    }
                }
            }
        }
    }

    async fn keep_alive(&mut self) -> KubedeckResult<()> {
        self.send(RelayMessage::info("Waiting for new log entries..."))
            .await?;

        if let Err(e) = until_cancelled(&self.cancel, self.connection.ping()).await {
            warn!("Ping to log stream client failed: {}", e);
            // the connection is most likely gone, but try to say why
            let _ = timeout(
                self.timings.read_timeout,
                self.send(RelayMessage::error("Connection lost")),
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    async fn stopped_by_user(&mut self) -> KubedeckResult<()> {
        self.send(RelayMessage::info("Log stream stopped by user"))
            .await
    }

    /// Deliver one message; a client that is not accepting cannot hold
    /// the stream past its cancellation
    async fn send(&mut self, message: RelayMessage) -> KubedeckResult<()> {
        until_cancelled(&self.cancel, self.connection.send(message)).await
    }
}

/// Observability record of an active log stream
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub namespace: String,
    pub pod: String,
    pub follow: bool,
    pub tail_lines: i64,
    pub buffer_size: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl StreamInfo {
    pub fn new(namespace: &str, pod: &str, options: LogStreamOptions) -> Self {
        let started_at = Utc::now();
        Self {
            id: format!(
                "{}-{}-{}",
                namespace,
                pod,
                started_at.timestamp_nanos_opt().unwrap_or_default()
            ),
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            follow: options.follow,
            tail_lines: options.tail_lines,
            buffer_size: options.buffer_size,
            started_at,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that ends the stream; also fired when the client disconnects
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Listing of active log streams, for observability and explicit stop
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, StreamInfo>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, info: StreamInfo) {
        self.streams.write().await.insert(info.id.clone(), info);
    }

    pub async fn remove(&self, id: &str) -> Option<StreamInfo> {
        self.streams.write().await.remove(id)
    }

    /// Snapshot of active streams, oldest first
    pub async fn list(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self.streams.read().await.values().cloned().collect();
        streams.sort_by_key(|s| s.started_at);
        streams
    }

    /// Stop a stream. Returns whether it was active.
    pub async fn stop(&self, id: &str) -> bool {
        match self.streams.write().await.remove(id) {
            Some(info) => {
                info.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every active stream
    pub async fn stop_all(&self) {
        for (_, info) in self.streams.write().await.drain() {
            info.cancel.cancel();
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }
}
