//! Edge dispatcher: pick a worker, admit the request, start the worker if new.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::http::request::RequestError;
use crate::observability::metrics;
use crate::protocol::{IncomingRequest, InitialRequest};
use crate::registry::{Registry, RegistryError};
use crate::session::{CancelOutcome, SessionDirectory, SessionError, WorkerResponse};

/// Times a request is re-routed after its worker turned out to be unusable.
const MAX_ROUTING_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("worker did not answer within {0}s")]
    Timeout(u64),
}

impl DispatchError {
    /// Status code returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Request(RequestError::BodyTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::Request(_) => StatusCode::BAD_REQUEST,
            DispatchError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Session(e) => match e {
                SessionError::WorkerClosing(_)
                | SessionError::WorkerUnavailable(_)
                | SessionError::ActorStopped
                | SessionError::BodyOverflow => StatusCode::SERVICE_UNAVAILABLE,
                // Request ids are generated here, so a clash is a router bug.
                SessionError::DuplicateRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
                SessionError::ConnectionLost(_)
                | SessionError::ProtocolViolation(_)
                | SessionError::BootstrapFailed(_)
                | SessionError::RequestNotFound(_) => StatusCode::BAD_GATEWAY,
            },
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Stateless per-request routing onto worker sessions.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    sessions: Arc<SessionDirectory>,
    admit_timeout: Duration,
    public_host: Option<String>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionDirectory>,
        admit_timeout: Duration,
        public_host: Option<String>,
    ) -> Self {
        Self {
            registry,
            sessions,
            admit_timeout,
            public_host,
        }
    }

    /// Route `request` to a worker and wait for its response headers.
    ///
    /// The request id the client sent (or the edge assigned) stays on the
    /// client side; every routing attempt gets a fresh id on the duplex
    /// connection. `host` is where a cold-started worker dials back to,
    /// unless a public host is configured.
    pub async fn dispatch(&self, request: IncomingRequest, host: &str) -> Result<WorkerResponse, DispatchError> {
        let client_request_id = request.request_id.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut routed = request.clone();
            routed.request_id = Uuid::new_v4().to_string();
            match self.dispatch_once(routed, &client_request_id, host).await {
                Err(DispatchError::Session(e)) if is_reroutable(&e) && attempt < MAX_ROUTING_ATTEMPTS => {
                    tracing::debug!(
                        client_request_id = %client_request_id,
                        attempt,
                        error = %e,
                        "Worker unusable, re-routing request"
                    );
                }
                result => return result,
            }
        }
    }

    async fn dispatch_once(
        &self,
        request: IncomingRequest,
        client_request_id: &str,
        host: &str,
    ) -> Result<WorkerResponse, DispatchError> {
        let request_id = request.request_id.clone();

        let (worker_id, cold) = match self.registry.acquire()? {
            Some(id) => (id, false),
            None => {
                let id = Uuid::new_v4().to_string();
                self.registry.create(&id)?;
                (id, true)
            }
        };
        tracing::debug!(
            client_request_id = %client_request_id,
            request_id = %request_id,
            worker_id = %worker_id,
            cold,
            "Worker selected"
        );

        let handle = self.sessions.get_or_spawn(&worker_id);
        let admitted = if cold {
            let initial = InitialRequest {
                request_id: request_id.clone(),
                server_id: worker_id.clone(),
                host: self.public_host.clone().unwrap_or_else(|| host.to_string()),
            };
            metrics::record_cold_start("started");
            handle.admit_cold(request, initial)
        } else {
            handle.admit(request)
        };
        let pending = match admitted {
            Ok(pending) => pending,
            Err(e) => {
                self.release(&worker_id, cold);
                return Err(e.into());
            }
        };

        match tokio::time::timeout(self.admit_timeout, pending.wait()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if is_reroutable(&e) || matches!(e, SessionError::DuplicateRequest(_)) {
                    // Never reached the worker, so no close will release it.
                    self.release(&worker_id, cold);
                }
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(request_id = %request_id, worker_id = %worker_id, "Timed out waiting for worker");
                if handle.cancel(&request_id).await == CancelOutcome::Dequeued {
                    self.release(&worker_id, cold);
                }
                Err(DispatchError::Timeout(self.admit_timeout.as_secs()))
            }
        }
    }

    fn release(&self, worker_id: &str, cold: bool) {
        if cold {
            return;
        }
        match self.registry.remove_connection(worker_id) {
            Ok(()) | Err(RegistryError::WorkerNotFound(_)) => {}
            Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Failed to release capacity"),
        }
    }
}

/// Errors raised before the worker saw the request, so another worker may take it.
fn is_reroutable(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::WorkerClosing(_) | SessionError::WorkerUnavailable(_) | SessionError::ActorStopped
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EdgeFrame, Headers, WorkerFrame};
    use crate::registry::{JsonFileStore, MemoryStore, RecordStore, WorkerRecord, WorkerStatus};
    use crate::session::{Connection, ConnectionPeer, InvokeFuture, SessionOptions, WorkerInvoker};
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records invocations and never finishes them.
    #[derive(Debug, Default)]
    struct RecordingInvoker {
        started: Mutex<Vec<InitialRequest>>,
    }

    impl WorkerInvoker for RecordingInvoker {
        fn invoke(&self, initial: InitialRequest) -> InvokeFuture {
            if let Ok(mut started) = self.started.lock() {
                started.push(initial);
            }
            Box::pin(std::future::pending())
        }
    }

    fn ready(id: &str, active: u32) -> WorkerRecord {
        WorkerRecord {
            id: id.into(),
            active_connections: active,
            status: WorkerStatus::Ready,
        }
    }

    type Setup = (Arc<Registry>, Arc<SessionDirectory>, Arc<RecordingInvoker>, Dispatcher);

    fn setup(records: Vec<WorkerRecord>) -> Setup {
        setup_with_store(Arc::new(MemoryStore::with_records(records)), Duration::from_secs(5))
    }

    fn setup_with_store(store: Arc<dyn RecordStore>, admit_timeout: Duration) -> Setup {
        let registry = Arc::new(Registry::load(store, &Default::default()).unwrap());
        let invoker = Arc::new(RecordingInvoker::default());
        let sessions = Arc::new(SessionDirectory::new(
            registry.clone(),
            invoker.clone(),
            SessionOptions::default(),
        ));
        let dispatcher = Dispatcher::new(registry.clone(), sessions.clone(), admit_timeout, None);
        (registry, sessions, invoker, dispatcher)
    }

    fn request(id: &str) -> IncomingRequest {
        IncomingRequest {
            request_id: id.into(),
            headers: Headers::new(),
            data: String::new(),
        }
    }

    /// Connect a fake worker that answers every request with `body`.
    async fn fake_worker(sessions: &SessionDirectory, worker_id: &str, body: &'static str) -> mpsc::UnboundedSender<WorkerFrame> {
        let (conn, mut peer) = Connection::pair();
        sessions.get_or_spawn(worker_id).accept_connection(conn).await.unwrap();
        let frames = peer.frames.clone();
        frames.send(WorkerFrame::Ready { server_id: worker_id.into() }).unwrap();

        let id = worker_id.to_string();
        tokio::spawn(async move {
            while let Some(EdgeFrame::Incoming(req)) = peer.outbound.recv().await {
                let _ = peer.frames.send(WorkerFrame::OutgoingHeaders {
                    request_id: req.request_id.clone(),
                    server_id: id.clone(),
                    headers: Headers::new(),
                });
                let _ = peer.frames.send(WorkerFrame::OutgoingData {
                    request_id: req.request_id.clone(),
                    server_id: id.clone(),
                    data: body.into(),
                });
                let _ = peer.frames.send(WorkerFrame::OutgoingClose {
                    request_id: req.request_id,
                    server_id: id.clone(),
                });
            }
        });
        frames
    }

    #[tokio::test]
    async fn test_cold_start_creates_worker_and_invokes_once() {
        let (registry, _sessions, invoker, dispatcher) = setup(vec![]);
        let dispatcher = Arc::new(dispatcher);

        let d = dispatcher.clone();
        let task = tokio::spawn(async move { d.dispatch(request("r1"), "edge.local:8080").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = registry.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, WorkerStatus::Pending);
        assert_eq!(records[0].active_connections, 0);

        let started = invoker.started.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].server_id, records[0].id);
        // The duplex connection gets a fresh id, never the client's.
        assert_ne!(started[0].request_id, "r1");
        assert!(Uuid::parse_str(&started[0].request_id).is_ok());
        assert_eq!(started[0].host, "edge.local:8080");
        task.abort();
    }

    /// Connect a worker whose frames the test drives by hand.
    async fn manual_worker(sessions: &SessionDirectory, worker_id: &str, ready: bool) -> ConnectionPeer {
        let (conn, peer) = Connection::pair();
        sessions.get_or_spawn(worker_id).accept_connection(conn).await.unwrap();
        if ready {
            peer.frames.send(WorkerFrame::Ready { server_id: worker_id.into() }).unwrap();
        }
        peer
    }

    async fn next_request_id(peer: &mut ConnectionPeer) -> String {
        match peer.outbound.recv().await {
            Some(EdgeFrame::Incoming(req)) => req.request_id,
            other => panic!("expected incoming frame, got {other:?}"),
        }
    }

    fn send_headers(peer: &ConnectionPeer, worker_id: &str, request_id: &str) {
        peer.frames
            .send(WorkerFrame::OutgoingHeaders {
                request_id: request_id.into(),
                server_id: worker_id.into(),
                headers: Headers::new(),
            })
            .unwrap();
    }

    fn send_body_and_close(peer: &ConnectionPeer, worker_id: &str, request_id: &str, body: &str) {
        peer.frames
            .send(WorkerFrame::OutgoingData {
                request_id: request_id.into(),
                server_id: worker_id.into(),
                data: body.into(),
            })
            .unwrap();
        peer.frames
            .send(WorkerFrame::OutgoingClose {
                request_id: request_id.into(),
                server_id: worker_id.into(),
            })
            .unwrap();
    }

    async fn body_text(response: WorkerResponse) -> String {
        let chunks: Vec<_> = response.body.collect().await;
        chunks
            .into_iter()
            .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_capacity_spills_to_new_worker() {
        let (registry, sessions, invoker, dispatcher) = setup(vec![ready("w1", 4)]);
        let dispatcher = Arc::new(dispatcher);
        let mut w1 = manual_worker(&sessions, "w1", true).await;

        // r1 runs to completion on w1
        let d = dispatcher.clone();
        let r1 = tokio::spawn(async move { d.dispatch(request("r1"), "edge").await });
        let id1 = next_request_id(&mut w1).await;
        send_headers(&w1, "w1", &id1);
        send_body_and_close(&w1, "w1", &id1, "one");
        assert_eq!(body_text(r1.await.unwrap().unwrap()).await, "one");
        assert_eq!(registry.get("w1").unwrap().active_connections, 4);

        // r2 also lands on w1 and stays open, filling it
        let d = dispatcher.clone();
        let r2 = tokio::spawn(async move { d.dispatch(request("r2"), "edge").await });
        let id2 = next_request_id(&mut w1).await;
        send_headers(&w1, "w1", &id2);
        let response2 = r2.await.unwrap().unwrap();
        assert_eq!(registry.get("w1").unwrap().active_connections, 5);

        // r3 finds w1 full and cold-starts a new worker
        let d = dispatcher.clone();
        let r3 = tokio::spawn(async move { d.dispatch(request("r3"), "edge").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = invoker.started.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        assert_ne!(started[0].server_id, "w1");
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.get("w1").unwrap().active_connections, 5);
        assert!(w1.outbound.try_recv().is_err());

        send_body_and_close(&w1, "w1", &id2, "two");
        assert_eq!(body_text(response2).await, "two");
        assert_eq!(registry.get("w1").unwrap().active_connections, 4);
        r3.abort();
    }

    #[tokio::test]
    async fn test_same_client_request_id_does_not_collide() {
        let (_registry, sessions, _invoker, dispatcher) = setup(vec![ready("w1", 0)]);
        let dispatcher = Arc::new(dispatcher);
        let mut w1 = manual_worker(&sessions, "w1", true).await;

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.dispatch(request("abc"), "edge").await })
            })
            .collect();

        let first = next_request_id(&mut w1).await;
        let second = next_request_id(&mut w1).await;
        assert_ne!(first, second);
        assert_ne!(first, "abc");
        for id in [&first, &second] {
            send_headers(&w1, "w1", id);
            send_body_and_close(&w1, "w1", id, "ok");
        }

        for task in tasks {
            assert_eq!(body_text(task.await.unwrap().unwrap()).await, "ok");
        }
    }

    #[tokio::test]
    async fn test_timed_out_queued_request_releases_capacity() {
        let store = Arc::new(MemoryStore::with_records(vec![ready("w1", 0)]));
        let (registry, sessions, _invoker, dispatcher) = setup_with_store(store, Duration::from_millis(100));
        // Connected but never ready: requests queue on the actor.
        let mut w1 = manual_worker(&sessions, "w1", false).await;

        for _ in 0..6 {
            let result = dispatcher.dispatch(request("r"), "edge").await;
            assert!(matches!(result, Err(DispatchError::Timeout(_))));
            assert_eq!(registry.get("w1").unwrap().active_connections, 0);
        }

        // Cancelled requests are not delivered once the worker turns ready.
        w1.frames.send(WorkerFrame::Ready { server_id: "w1".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(w1.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timed_out_dispatched_request_released_by_close() {
        let store = Arc::new(MemoryStore::with_records(vec![ready("w1", 0)]));
        let (registry, sessions, _invoker, dispatcher) = setup_with_store(store, Duration::from_millis(100));
        let mut w1 = manual_worker(&sessions, "w1", true).await;

        let result = dispatcher.dispatch(request("r1"), "edge").await;
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
        let id = next_request_id(&mut w1).await;
        // Still running on the worker.
        assert_eq!(registry.get("w1").unwrap().active_connections, 1);

        send_headers(&w1, "w1", &id);
        send_body_and_close(&w1, "w1", &id, "too late");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get("w1").unwrap().active_connections, 0);
    }

    #[tokio::test]
    async fn test_reloaded_registry_drops_stale_workers() {
        let path = std::env::temp_dir().join(format!("workers-{}.json", Uuid::new_v4()));
        JsonFileStore::open(&path).unwrap().put(&ready("w1", 2)).unwrap();

        // A restarted router: the record survived, its connection did not.
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let (registry, _sessions, invoker, dispatcher) = setup_with_store(store, Duration::from_secs(5));
        let dispatcher = Arc::new(dispatcher);

        let d = dispatcher.clone();
        let task = tokio::spawn(async move { d.dispatch(request("r1"), "edge").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.get("w1").is_none());
        let started = invoker.started.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        assert_ne!(started[0].server_id, "w1");

        let persisted = JsonFileStore::open(&path).unwrap().load_all().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, started[0].server_id);
        assert_eq!(persisted[0].status, WorkerStatus::Pending);

        task.abort();
        std::fs::remove_file(&path).unwrap_or_default();
    }

    #[tokio::test]
    async fn test_closing_worker_is_skipped() {
        let (registry, sessions, _invoker, dispatcher) = setup(vec![ready("w1", 0), ready("w2", 0)]);
        let w1 = fake_worker(&sessions, "w1", "from w1").await;
        let _w2 = fake_worker(&sessions, "w2", "from w2").await;

        w1.send(WorkerFrame::Closing { server_id: "w1".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Closing);

        let response = dispatcher.dispatch(request("r1"), "edge").await.unwrap();
        let chunks: Vec<_> = response.body.collect().await;
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"from w2");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            DispatchError::Registry(RegistryError::WorkerNotFound("w".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DispatchError::Session(SessionError::ConnectionLost("w".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            DispatchError::Session(SessionError::WorkerClosing("w".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            DispatchError::Session(SessionError::WorkerUnavailable("w".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(DispatchError::Timeout(30).status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
