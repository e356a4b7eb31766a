//! Port-forward session records.
//!
//! A [`Session`] is created by the HTTP layer, registered in the
//! [`SessionRegistry`](crate::registry::SessionRegistry) and then driven by a
//! single [`TunnelEstablisher`](crate::tunnel::TunnelEstablisher) task. The
//! task is the only writer of the mutable lifecycle state; everyone else
//! reads copies of it.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{KubedeckError, KubedeckResult},
    forwarding::PortPair,
};

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }

    /// Whether `next` is reachable from this status
    fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Starting, SessionStatus::Running) => true,
            (SessionStatus::Starting | SessionStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a session, copied out on every read
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Set only on the transition to running
    pub started_at: Option<DateTime<Utc>>,
    /// Cause of the transition to error
    pub error: Option<String>,
}

/// A tracked port-forward tunnel
#[derive(Debug)]
pub struct Session {
    id: String,
    pod: String,
    namespace: String,
    ports: Vec<PortPair>,
    created_at: DateTime<Utc>,
    url: String,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in the `starting` state
    ///
    /// The first pair is the session's primary binding and determines its
    /// id and display URL. An empty `ports` list is rejected.
    pub fn new(namespace: &str, pod: &str, ports: Vec<PortPair>) -> KubedeckResult<Self> {
        let Some(&primary) = ports.first() else {
            return Err(KubedeckError::Config(
                "A session needs at least one port pair".to_string(),
            ));
        };

        let created_at = Utc::now();
        let (state, _) = watch::channel(SessionState {
            status: SessionStatus::Starting,
            started_at: None,
            error: None,
        });

        Ok(Self {
            id: generate_session_id(namespace, pod, primary, created_at),
            pod: pod.to_string(),
            namespace: namespace.to_string(),
            url: format!("http://localhost:{}", primary.local_port),
            ports,
            created_at,
            state,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ports(&self) -> &[PortPair] {
        &self.ports
    }

    pub fn local_port(&self) -> u16 {
        self.ports[0].local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.ports[0].remote_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cancellation token fired by an explicit stop
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Copy of the current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Mark the tunnel as forwarding
    pub fn mark_running(&self) -> bool {
        self.transition(SessionStatus::Running, None)
    }

    pub fn mark_stopped(&self) -> bool {
        self.transition(SessionStatus::Stopped, None)
    }

    pub fn mark_error(&self, error: impl Into<String>) -> bool {
        self.transition(SessionStatus::Error, Some(error.into()))
    }

    /// Apply a transition if the state machine allows it
    fn transition(&self, next: SessionStatus, error: Option<String>) -> bool {
        self.state.send_if_modified(|state| {
            if !state.status.can_transition_to(next) {
                return false;
            }
            state.status = next;
            if next == SessionStatus::Running {
                state.started_at = Some(Utc::now());
            }
            if error.is_some() {
                state.error = error;
            }
            true
        })
    }

    /// Wait until the session leaves `starting`, up to `limit`
    ///
    /// Returns the state observed when the wait ended.
    pub async fn wait_until_settled(&self, limit: Duration) -> SessionState {
        self.wait_for(limit, |s| s.status != SessionStatus::Starting)
            .await
    }

    /// Wait until the session reaches a terminal status, up to `limit`
    pub async fn wait_until_terminal(&self, limit: Duration) -> SessionState {
        self.wait_for(limit, |s| s.status.is_terminal()).await
    }

    async fn wait_for(&self, limit: Duration, done: impl Fn(&SessionState) -> bool) -> SessionState {
        let mut rx = self.state.subscribe();
        // the sender lives in `self`, so the channel never closes while we wait
        let _ = tokio::time::timeout(limit, rx.wait_for(|s| done(s))).await;
        self.state()
    }

    /// Serializable view of the session
    pub fn summary(&self) -> SessionSummary {
        let state = self.state();
        SessionSummary {
            id: self.id.clone(),
            pod: self.pod.clone(),
            namespace: self.namespace.clone(),
            local_port: self.local_port(),
            remote_port: self.remote_port(),
            ports: self.ports.clone(),
            status: state.status,
            created_at: self.created_at.to_rfc3339(),
            started_at: state
                .started_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            url: self.url.clone(),
            error: state.error,
        }
    }
}

/// Wire representation of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub pod: String,
    pub namespace: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub ports: Vec<PortPair>,
    pub status: SessionStatus,
    pub created_at: String,
    /// Empty until the session is running
    pub started_at: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build a session id from its target, primary ports and creation time
pub fn generate_session_id(
    namespace: &str,
    pod: &str,
    primary: PortPair,
    created_at: DateTime<Utc>,
) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        namespace,
        pod,
        primary.remote_port,
        primary.local_port,
        created_at.timestamp()
    )
}
