//! Directory of live session actors keyed by worker id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::registry::Registry;
use crate::session::bootstrap::WorkerInvoker;
use crate::session::handle::{SessionHandle, SessionOptions};

/// Spawns session actors on demand and hands out their handles.
#[derive(Debug)]
pub struct SessionDirectory {
    sessions: DashMap<String, SessionHandle>,
    registry: Arc<Registry>,
    invoker: Arc<dyn WorkerInvoker>,
    options: SessionOptions,
}

impl SessionDirectory {
    pub fn new(registry: Arc<Registry>, invoker: Arc<dyn WorkerInvoker>, options: SessionOptions) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            invoker,
            options,
        }
    }

    /// Handle for `worker_id`, spawning a new actor if none is running.
    pub fn get_or_spawn(&self, worker_id: &str) -> SessionHandle {
        let mut entry = self
            .sessions
            .entry(worker_id.to_string())
            .or_insert_with(|| self.spawn(worker_id));

        if entry.is_closed() {
            tracing::debug!(worker_id = %worker_id, "Respawning session actor");
            *entry = self.spawn(worker_id);
        }
        entry.clone()
    }

    /// Handle for `worker_id` if its actor is still running.
    pub fn get(&self, worker_id: &str) -> Option<SessionHandle> {
        self.sessions
            .get(worker_id)
            .map(|h| h.clone())
            .filter(|h| !h.is_closed())
    }

    /// Drop handles whose actor has exited.
    pub fn prune(&self) {
        self.sessions.retain(|_, handle| !handle.is_closed());
    }

    /// Number of live actors.
    pub fn len(&self) -> usize {
        self.sessions.iter().filter(|h| !h.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn(&self, worker_id: &str) -> SessionHandle {
        SessionHandle::spawn(worker_id, self.registry.clone(), self.invoker.clone(), self.options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InitialRequest, WorkerFrame};
    use crate::registry::MemoryStore;
    use crate::session::bootstrap::{BootstrapError, InvokeFuture};
    use crate::session::handle::Connection;
    use std::time::Duration;

    #[derive(Debug)]
    struct FailingInvoker;

    impl WorkerInvoker for FailingInvoker {
        fn invoke(&self, _initial: InitialRequest) -> InvokeFuture {
            Box::pin(async { Err(BootstrapError::Status(500)) })
        }
    }

    fn directory() -> SessionDirectory {
        let registry = Arc::new(Registry::load(Arc::new(MemoryStore::new()), &Default::default()).unwrap());
        SessionDirectory::new(registry, Arc::new(FailingInvoker), SessionOptions::default())
    }

    #[tokio::test]
    async fn test_same_handle_while_running() {
        let dir = directory();
        let a = dir.get_or_spawn("w1");
        let (conn, _peer) = Connection::pair();
        a.accept_connection(conn).await.unwrap();

        let b = dir.get_or_spawn("w1");
        let (conn, _peer2) = Connection::pair();
        let ack = b.accept_connection(conn).await.unwrap();
        assert_eq!(ack.generation, 2);
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_respawns_after_actor_exit() {
        let dir = directory();
        let handle = dir.get_or_spawn("w1");
        let (conn, peer) = Connection::pair();
        handle.accept_connection(conn).await.unwrap();
        peer.frames
            .send(WorkerFrame::Ready { server_id: "w1".into() })
            .unwrap();
        drop(peer);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_closed());
        assert!(dir.get("w1").is_none());

        let fresh = dir.get_or_spawn("w1");
        assert!(!fresh.is_closed());
        let (conn, _peer) = Connection::pair();
        assert_eq!(fresh.accept_connection(conn).await.unwrap().generation, 1);

        dir.prune();
        assert_eq!(dir.len(), 1);
    }
}
