//! Framing and delivery of messages to streaming clients.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chrono::{SecondsFormat, Utc};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{KubedeckError, KubedeckResult};

/// Kind tag of a relayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Log,
    Info,
    Warning,
    Error,
}

/// The envelope every streaming endpoint sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Delivery time, RFC3339
    pub time: String,
}

impl RelayMessage {
    pub fn new(kind: MessageKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self::new(MessageKind::Log, line)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(MessageKind::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(MessageKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Persistent duplex channel to a streaming client
///
/// There is a single producer per connection, so messages arrive in the
/// order they were sent.
#[async_trait]
pub trait ClientConnection: Send {
    async fn send(&mut self, message: RelayMessage) -> KubedeckResult<()>;

    /// Check the client is still there with a control ping
    async fn ping(&mut self) -> KubedeckResult<()>;
}

/// Run a client operation, abandoning it once `cancel` fires
///
/// An operation that completes on its first poll still wins over an
/// already-fired token, so final messages reach a client that keeps up.
pub async fn until_cancelled<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = KubedeckResult<T>>,
) -> KubedeckResult<T> {
    tokio::select! {
        biased;
        done = operation => done,
        _ = cancel.cancelled() => Err(KubedeckError::Connection(
            "cancelled while the client was not accepting".to_string(),
        )),
    }
}

/// [`ClientConnection`] over an axum WebSocket
///
/// Outgoing frames go through a bounded queue drained by a writer task, so
/// a slow client applies backpressure to the producer instead of growing
/// memory. A reader task watches for the client going away and fires the
/// connection's cancellation token. A frame the client does not accept
/// within the write timeout counts as a lost connection.
pub struct WsConnection {
    tx: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    write_timeout: Duration,
    /// Set by a ping, cleared by the client's pong
    pong_pending: Arc<AtomicBool>,
}

impl WsConnection {
    /// Split `socket` and start the writer and reader tasks
    ///
    /// `closed` is cancelled when the client closes the socket, a write
    /// stalls past `write_timeout` or the connection fails. `buffer_size`
    /// bounds the outgoing queue.
    pub fn start(
        socket: WebSocket,
        buffer_size: usize,
        write_timeout: Duration,
        closed: CancellationToken,
    ) -> Self {
        let (sink, mut receiver) = socket.split();
        let (tx, rx) = mpsc::channel::<Message>(buffer_size.max(1));
        let pong_pending = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_frames(sink, rx, write_timeout, closed.clone()));

        let pong = Arc::clone(&pong_pending);
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = receiver.next() => match frame {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            debug!("Client connection closed");
                            closed.cancel();
                            break;
                        }
                        Some(Ok(Message::Pong(_))) => pong.store(false, Ordering::SeqCst),
                        // client chatter carries nothing for us
                        Some(Ok(_)) => {}
                    },
                }
            }
        });

        Self {
            tx,
            writer,
            reader,
            write_timeout,
            pong_pending,
        }
    }

    /// Flush queued frames, send a close frame and wait for the writer
    ///
    /// Bounded by the write timeout; a writer still busy after that is
    /// aborted.
    pub async fn close(self) {
        let Self {
            tx,
            mut writer,
            reader,
            write_timeout,
            ..
        } = self;

        let flushed = timeout(write_timeout, async {
            let _ = tx.send(Message::Close(None)).await;
            drop(tx);
            let _ = (&mut writer).await;
        })
        .await;
        if flushed.is_err() {
            debug!("Client did not drain within {:?}, dropping connection", write_timeout);
            writer.abort();
        }
        reader.abort();
    }

    async fn enqueue(&mut self, frame: Message) -> KubedeckResult<()> {
        self.tx.send(frame).await.map_err(|_| connection_lost())
    }
}

fn connection_lost() -> KubedeckError {
    KubedeckError::Connection("client connection lost".to_string())
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    write_timeout: Duration,
    closed: CancellationToken,
) {
    while let Some(frame) = rx.recv().await {
        let is_close = matches!(frame, Message::Close(_));
        match timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Failed to send WebSocket frame: {}", e);
                closed.cancel();
                break;
            }
            Err(_) => {
                warn!("WebSocket write stalled for {:?}, dropping client", write_timeout);
                closed.cancel();
                break;
            }
        }
        if is_close {
            break;
        }
    }
}

#[async_trait]
impl ClientConnection for WsConnection {
    async fn send(&mut self, message: RelayMessage) -> KubedeckResult<()> {
        let text = serde_json::to_string(&message)
            .map_err(|e| KubedeckError::Other(format!("Failed to encode message: {e}")))?;
        self.enqueue(Message::Text(text.into())).await
    }

    /// Queue a ping without waiting for room
    ///
    /// Fails when the writer is gone, when the outgoing queue is full or
    /// when the client never answered the previous ping.
    async fn ping(&mut self) -> KubedeckResult<()> {
        if self.writer.is_finished() {
            return Err(connection_lost());
        }
        if self.pong_pending.swap(true, Ordering::SeqCst) {
            return Err(KubedeckError::Timeout(
                "client did not answer the previous ping".to_string(),
            ));
        }
        self.tx
            .try_send(Message::Ping(Vec::new().into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    KubedeckError::Timeout("client is not draining its messages".to_string())
                }
                TrySendError::Closed(_) => connection_lost(),
            })
    }
}
