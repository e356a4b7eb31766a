use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionSummary};

/// A registered session plus the registry's own bookkeeping
#[derive(Debug)]
struct SessionEntry {
    session: Arc<Session>,
    /// Whether the stop signal has already been fired for this entry
    stop_signaled: bool,
}

/// Concurrency-safe store of active port-forward sessions
///
/// Cloning is cheap; clones share the same map. The registry never evicts
/// on its own: entries leave only through [`SessionRegistry::remove`],
/// called by the task driving the session. No I/O is done under the lock.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Returns `false`, leaving the existing entry in
    /// place, if the id is already taken.
    pub async fn add(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            warn!(session_id = %session.id(), "Session id collision, not overwriting");
            return false;
        }

        debug!(session_id = %session.id(), "Registered session");
        sessions.insert(
            session.id().to_string(),
            SessionEntry {
                session,
                stop_signaled: false,
            },
        );
        true
    }

    /// Remove a session. Absent ids are ignored.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "Removed session");
        }
        removed.map(|entry| entry.session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|entry| Arc::clone(&entry.session))
    }

    /// Snapshot of all sessions, oldest first
    ///
    /// Entries may be removed concurrently after the snapshot is taken;
    /// callers must re-check with [`SessionRegistry::get`] before acting.
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut snapshot: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .map(|entry| Arc::clone(&entry.session))
                .collect()
        };
        snapshot.sort_by_key(|s| s.created_at());
        snapshot
    }

    /// Summaries of all sessions, oldest first
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        self.list().await.iter().map(|s| s.summary()).collect()
    }

    /// Signal a session to stop. Returns whether the session exists.
    ///
    /// The cancellation fires at most once per entry; repeated calls while
    /// the session is still unwinding only report existence.
    pub async fn stop(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };

        if !entry.stop_signaled {
            entry.stop_signaled = true;
            entry.session.cancel_token().cancel();
            info!(session_id = %id, "Stop signaled");
        }
        true
    }

    /// Signal every registered session to stop
    pub async fn stop_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut signaled = 0;
        for (id, entry) in sessions.iter_mut() {
            if !entry.stop_signaled {
                entry.stop_signaled = true;
                entry.session.cancel_token().cancel();
                debug!(session_id = %id, "Stop signaled");
                signaled += 1;
            }
        }
        signaled
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::PortPair;

    fn session(pod: &str, local_port: u16) -> Arc<Session> {
        Arc::new(Session::new(
            "market",
            pod,
            vec![PortPair::new(local_port, 8080)],
        )
        .unwrap())
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = SessionRegistry::new();
        let s = session("web-1", 18080);
        let id = s.id().to_string();

        assert!(registry.add(s).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&id).await.is_some());

        assert!(registry.remove(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
        // removing twice is a no-op
        assert!(registry.remove(&id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_does_not_overwrite() {
        let registry = SessionRegistry::new();
        let first = session("web-1", 18080);
        let id = first.id().to_string();
        assert!(registry.add(Arc::clone(&first)).await);

        // same namespace, pod, ports and second: same id
        let mut dup = session("web-1", 18080);
        while dup.id() != id {
            dup = session("web-1", 18080);
        }
        assert!(!registry.add(dup).await);

        let kept = registry.get(&id).await.unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
    }

    #[tokio::test]
    async fn test_stop_fires_once() {
        let registry = SessionRegistry::new();
        let s = session("web-1", 18080);
        let id = s.id().to_string();
        registry.add(Arc::clone(&s)).await;

        assert!(!s.cancel_token().is_cancelled());
        assert!(registry.stop(&id).await);
        assert!(s.cancel_token().is_cancelled());
        // still registered until its task removes it
        assert!(registry.stop(&id).await);

        registry.remove(&id).await;
        assert!(!registry.stop(&id).await);
        assert!(!registry.stop("xyz").await);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = SessionRegistry::new();
        let a = session("web-1", 18080);
        let b = session("web-2", 18081);
        registry.add(Arc::clone(&a)).await;
        registry.add(Arc::clone(&b)).await;

        let listed = registry.list().await;
        registry.remove(a.id()).await;

        assert_eq!(listed.len(), 2);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.summaries().await[0].pod, "web-2");
    }

    #[tokio::test]
    async fn test_stop_all() {
        let registry = SessionRegistry::new();
        let a = session("web-1", 18080);
        let b = session("web-2", 18081);
        registry.add(Arc::clone(&a)).await;
        registry.add(Arc::clone(&b)).await;
        registry.stop(a.id()).await;

        assert_eq!(registry.stop_all().await, 1);
        assert!(a.cancel_token().is_cancelled());
        assert!(b.cancel_token().is_cancelled());
    }
}
