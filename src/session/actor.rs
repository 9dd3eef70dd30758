//! Session actor: the frame-handling state machine for one worker id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::body::Bytes;
use tokio::sync::mpsc;

use crate::observability::metrics;
use crate::protocol::{EdgeFrame, Headers, IncomingRequest, InitialRequest, WorkerFrame};
use crate::registry::{Registry, RegistryError, WorkerStatus};
use crate::session::body::{body_channel, BodySink, Push, WorkerResponse};
use crate::session::bootstrap::{BootstrapError, WorkerInvoker};
use crate::session::handle::{CancelOutcome, Command, Connection, ResponseReply, SessionOptions, UpgradeAck};
use crate::session::SessionError;

/// The connection currently owned by the actor.
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<EdgeFrame>,
    inbound: mpsc::UnboundedReceiver<WorkerFrame>,
    ready: bool,
    closing: bool,
}

enum RequestState {
    AwaitingHeaders(ResponseReply),
    Streaming(BodySink),
    /// Failed or abandoned; remaining frames are dropped until the close.
    Aborted,
}

struct RequestSession {
    /// Generation of the connection the `incoming` frame went out on.
    dispatched_on: Option<u64>,
    state: RequestState,
}

enum Event {
    Command(Option<Command>),
    Frame(Option<WorkerFrame>),
}

pub(crate) struct SessionActor {
    worker_id: String,
    registry: Arc<Registry>,
    invoker: Arc<dyn WorkerInvoker>,
    options: SessionOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    link: Option<Link>,
    generation: u64,
    sessions: HashMap<String, RequestSession>,
    /// Admitted requests waiting for the worker to become ready.
    queue: VecDeque<IncomingRequest>,
    bootstrap_in_flight: bool,
}

async fn next_frame(link: &mut Option<Link>) -> Option<WorkerFrame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub(crate) fn new(
        worker_id: String,
        registry: Arc<Registry>,
        invoker: Arc<dyn WorkerInvoker>,
        options: SessionOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        self_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            worker_id,
            registry,
            invoker,
            options,
            commands,
            self_tx,
            link: None,
            generation: 0,
            sessions: HashMap::new(),
            queue: VecDeque::new(),
            bootstrap_in_flight: false,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(worker_id = %self.worker_id, "Session actor started");

        loop {
            let event = tokio::select! {
                cmd = self.commands.recv() => Event::Command(cmd),
                frame = next_frame(&mut self.link) => Event::Frame(frame),
            };

            match event {
                Event::Command(Some(cmd)) => self.handle_command(cmd),
                Event::Command(None) => break,
                Event::Frame(Some(frame)) => self.handle_frame(frame),
                Event::Frame(None) => self.handle_disconnect(),
            }

            if self.is_idle() {
                break;
            }
        }

        tracing::debug!(worker_id = %self.worker_id, "Session actor stopped");
    }

    /// Nothing left to do: no connection, no requests, no start in flight.
    fn is_idle(&self) -> bool {
        self.link.is_none() && self.sessions.is_empty() && !self.bootstrap_in_flight
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Admit {
                request,
                bootstrap,
                reply,
            } => self.admit(request, bootstrap, reply),
            Command::Cancel { request_id, reply } => {
                let _ = reply.send(self.cancel(&request_id));
            }
            Command::BootstrapFinished { result } => self.finish_bootstrap(result),
            Command::Accept { connection, reply } => {
                let ack = self.accept(connection);
                let _ = reply.send(ack);
            }
        }
    }

    fn admit(&mut self, request: IncomingRequest, bootstrap: Option<InitialRequest>, reply: ResponseReply) {
        let request_id = request.request_id.clone();

        if self.link.as_ref().is_some_and(|l| l.closing) {
            let _ = reply.send(Err(SessionError::WorkerClosing(self.worker_id.clone())));
            return;
        }
        if self.sessions.contains_key(&request_id) {
            let _ = reply.send(Err(SessionError::DuplicateRequest(request_id)));
            return;
        }
        if let Some(initial) = bootstrap {
            self.start_bootstrap(initial);
        }
        if self.link.is_none() && !self.bootstrap_in_flight {
            // A record without a live worker, e.g. persisted before a restart.
            tracing::warn!(
                worker_id = %self.worker_id,
                request_id = %request_id,
                "Worker has no connection, dropping its record"
            );
            self.forget_worker();
            let _ = reply.send(Err(SessionError::WorkerUnavailable(self.worker_id.clone())));
            return;
        }

        self.sessions.insert(
            request_id.clone(),
            RequestSession {
                dispatched_on: None,
                state: RequestState::AwaitingHeaders(reply),
            },
        );

        if self.link.as_ref().is_some_and(|l| l.ready) {
            self.dispatch(request);
        } else {
            tracing::debug!(
                worker_id = %self.worker_id,
                request_id = %request_id,
                queued = self.queue.len() + 1,
                "Worker not ready, queueing request"
            );
            self.queue.push_back(request);
        }
    }

    /// Send an `incoming` frame on the current (ready) link.
    fn dispatch(&mut self, request: IncomingRequest) {
        let Some(link) = self.link.as_ref() else {
            self.queue.push_back(request);
            return;
        };
        let request_id = request.request_id.clone();
        if link.outbound.send(EdgeFrame::Incoming(request)).is_err() {
            // The transport is gone; the disconnect event fails this request.
            tracing::debug!(worker_id = %self.worker_id, request_id = %request_id, "Outbound link closed");
        }
        if let Some(session) = self.sessions.get_mut(&request_id) {
            session.dispatched_on = Some(link.generation);
        }
        tracing::debug!(worker_id = %self.worker_id, request_id = %request_id, "Request dispatched");
    }

    fn flush_queue(&mut self) {
        while let Some(request) = self.queue.pop_front() {
            if self.sessions.contains_key(&request.request_id) {
                self.dispatch(request);
            }
        }
    }

    fn cancel(&mut self, request_id: &str) -> CancelOutcome {
        let Some(session) = self.sessions.get_mut(request_id) else {
            return CancelOutcome::Unknown;
        };
        if session.dispatched_on.is_some() {
            // Keep the entry so the worker's close still releases capacity.
            session.state = RequestState::Aborted;
            tracing::debug!(worker_id = %self.worker_id, request_id = %request_id, "Request abandoned by caller");
            return CancelOutcome::Abandoned;
        }
        self.sessions.remove(request_id);
        self.queue.retain(|r| r.request_id != request_id);
        tracing::debug!(worker_id = %self.worker_id, request_id = %request_id, "Queued request cancelled");
        CancelOutcome::Dequeued
    }

    fn start_bootstrap(&mut self, initial: InitialRequest) {
        if self.bootstrap_in_flight {
            tracing::debug!(worker_id = %self.worker_id, "Reusing in-flight worker bootstrap");
            return;
        }
        if self.link.is_some() {
            tracing::debug!(worker_id = %self.worker_id, "Worker already connected, skipping bootstrap");
            return;
        }

        self.bootstrap_in_flight = true;
        tracing::info!(
            worker_id = %self.worker_id,
            request_id = %initial.request_id,
            host = %initial.host,
            "Starting worker"
        );

        let invocation = self.invoker.invoke(initial);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = invocation.await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(Command::BootstrapFinished { result });
            }
        });
    }

    fn finish_bootstrap(&mut self, result: Result<(), BootstrapError>) {
        self.bootstrap_in_flight = false;
        let message = match result {
            Ok(()) => {
                metrics::record_cold_start("completed");
                tracing::debug!(worker_id = %self.worker_id, "Worker invocation returned");
                "worker exited without connecting".to_string()
            }
            Err(e) => {
                metrics::record_cold_start("failed");
                tracing::error!(worker_id = %self.worker_id, error = %e, "Worker bootstrap failed");
                e.to_string()
            }
        };

        if self.link.is_none() && !self.queue.is_empty() {
            // Nobody will ever serve the queued requests.
            self.fail_undispatched(|| SessionError::BootstrapFailed(message.clone()));
            self.forget_worker();
        }
    }

    fn accept(&mut self, connection: Connection) -> UpgradeAck {
        self.generation += 1;
        let replaced = self.link.take().is_some();
        if replaced {
            tracing::info!(
                worker_id = %self.worker_id,
                generation = self.generation,
                "Replacing worker connection"
            );
            let old = self.generation - 1;
            self.fail_dispatched_on(old);
        }

        self.link = Some(Link {
            generation: self.generation,
            outbound: connection.outbound,
            inbound: connection.inbound,
            ready: false,
            closing: false,
        });
        tracing::info!(worker_id = %self.worker_id, generation = self.generation, "Worker connection accepted");

        UpgradeAck {
            worker_id: self.worker_id.clone(),
            generation: self.generation,
            replaced,
        }
    }

    fn handle_frame(&mut self, frame: WorkerFrame) {
        metrics::record_frame(frame.kind());

        if frame.server_id() != self.worker_id {
            tracing::warn!(
                worker_id = %self.worker_id,
                frame_server_id = %frame.server_id(),
                frame_type = frame.kind(),
                "Dropping frame addressed to another worker"
            );
            metrics::record_frame_dropped("worker_mismatch");
            return;
        }

        match frame {
            WorkerFrame::Ready { .. } => self.on_ready(),
            WorkerFrame::Closing { .. } => self.on_closing(),
            WorkerFrame::OutgoingHeaders { request_id, headers, .. } => self.on_headers(request_id, headers),
            WorkerFrame::OutgoingData { request_id, data, .. } => self.on_data(request_id, data),
            WorkerFrame::OutgoingClose { request_id, .. } => self.on_close(request_id),
        }
    }

    fn on_ready(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.ready = true;
        }
        tracing::info!(worker_id = %self.worker_id, queued = self.queue.len(), "Worker ready");
        let result = match self.registry.set_status(&self.worker_id, WorkerStatus::Ready) {
            Err(RegistryError::WorkerNotFound(_)) => {
                // A worker the registry has forgotten (e.g. after a restart) is adopted.
                tracing::info!(worker_id = %self.worker_id, "Adopting unknown worker");
                self.registry
                    .create(&self.worker_id)
                    .and_then(|()| self.registry.set_status(&self.worker_id, WorkerStatus::Ready))
            }
            other => other,
        };
        self.notify_registry("set_status", result);
        self.flush_queue();
    }

    fn on_closing(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.closing = true;
        }
        tracing::info!(worker_id = %self.worker_id, "Worker closing");
        self.notify_registry(
            "set_status",
            self.registry.set_status(&self.worker_id, WorkerStatus::Closing),
        );
        let worker_id = self.worker_id.clone();
        self.fail_undispatched(|| SessionError::WorkerClosing(worker_id.clone()));
    }

    fn on_headers(&mut self, request_id: String, headers: Headers) {
        let max_chunks = self.options.max_buffered_chunks;
        let worker_id = self.worker_id.clone();
        let Some(session) = self.lookup(&request_id, "outgoing-headers") else {
            return;
        };

        match std::mem::replace(&mut session.state, RequestState::Aborted) {
            RequestState::AwaitingHeaders(reply) => {
                let (sink, body) = body_channel(max_chunks);
                if reply.send(Ok(WorkerResponse { headers, body })).is_ok() {
                    session.state = RequestState::Streaming(sink);
                } else {
                    tracing::debug!(request_id = %request_id, "Client gone before headers arrived");
                }
            }
            RequestState::Streaming(sink) => {
                session.state = RequestState::Streaming(sink);
                tracing::warn!(worker_id = %worker_id, request_id = %request_id, "Duplicate outgoing-headers dropped");
                metrics::record_frame_dropped("duplicate_headers");
            }
            RequestState::Aborted => {}
        }
    }

    fn on_data(&mut self, request_id: String, data: String) {
        let worker_id = self.worker_id.clone();
        let Some(session) = self.lookup(&request_id, "outgoing-data") else {
            return;
        };

        match &session.state {
            RequestState::AwaitingHeaders(_) => {
                tracing::warn!(worker_id = %worker_id, request_id = %request_id, "Data before headers");
                if let RequestState::AwaitingHeaders(reply) =
                    std::mem::replace(&mut session.state, RequestState::Aborted)
                {
                    let _ = reply.send(Err(SessionError::ProtocolViolation("data before headers")));
                }
            }
            RequestState::Streaming(sink) => match sink.push(Bytes::from(data)) {
                Push::Accepted => {}
                Push::Closed => {
                    tracing::debug!(request_id = %request_id, "Client closed body, dropping data");
                    session.state = RequestState::Aborted;
                }
                Push::Overflowed => {
                    tracing::warn!(worker_id = %worker_id, request_id = %request_id, "Response body buffer overflowed");
                    metrics::record_frame_dropped("body_overflow");
                    session.state = RequestState::Aborted;
                }
            },
            RequestState::Aborted => {}
        }
    }

    fn on_close(&mut self, request_id: String) {
        let Some(session) = self.sessions.remove(&request_id) else {
            self.log_unknown(&request_id, "outgoing-close");
            return;
        };

        match session.state {
            RequestState::AwaitingHeaders(reply) => {
                tracing::warn!(worker_id = %self.worker_id, request_id = %request_id, "Close before headers");
                let _ = reply.send(Err(SessionError::ProtocolViolation("close before headers")));
            }
            // Dropping the sink ends the body stream.
            RequestState::Streaming(_) | RequestState::Aborted => {}
        }
        tracing::debug!(worker_id = %self.worker_id, request_id = %request_id, "Request completed");

        self.notify_registry("remove_connection", self.registry.remove_connection(&self.worker_id));
    }

    fn handle_disconnect(&mut self) {
        let link = self.link.take();
        let generation = link.as_ref().map(|l| l.generation);
        let announced_closing = link.is_some_and(|l| l.closing);
        tracing::info!(
            worker_id = %self.worker_id,
            generation = ?generation,
            pending = self.sessions.len(),
            "Worker connection closed"
        );

        let worker_id = self.worker_id.clone();
        for (request_id, session) in self.sessions.drain() {
            // A worker that announced `closing` finishes every stream it read,
            // so a request still waiting for headers never reached it.
            let err = match session.state {
                RequestState::AwaitingHeaders(_) if announced_closing => {
                    SessionError::WorkerClosing(worker_id.clone())
                }
                _ => SessionError::ConnectionLost(worker_id.clone()),
            };
            tracing::debug!(worker_id = %worker_id, request_id = %request_id, error = %err, "Failing request");
            fail(session.state, err);
        }
        self.queue.clear();
        self.forget_worker();
    }

    /// Delete this worker's registry record; an already missing one is fine.
    fn forget_worker(&self) {
        match self.registry.delete(&self.worker_id) {
            Ok(()) | Err(RegistryError::WorkerNotFound(_)) => {}
            Err(e) => tracing::error!(worker_id = %self.worker_id, error = %e, "Registry delete failed"),
        }
    }

    /// Fail every request whose `incoming` frame went out on `generation`.
    fn fail_dispatched_on(&mut self, generation: u64) {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.dispatched_on == Some(generation))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(session) = self.sessions.remove(&id) {
                fail(session.state, SessionError::ConnectionLost(self.worker_id.clone()));
            }
        }
    }

    fn fail_undispatched(&mut self, err: impl Fn() -> SessionError) {
        for request in self.queue.drain(..) {
            if let Some(session) = self.sessions.remove(&request.request_id) {
                fail(session.state, err());
            }
        }
    }

    fn lookup(&mut self, request_id: &str, kind: &'static str) -> Option<&mut RequestSession> {
        if !self.sessions.contains_key(request_id) {
            self.log_unknown(request_id, kind);
            return None;
        }
        self.sessions.get_mut(request_id)
    }

    fn log_unknown(&self, request_id: &str, kind: &'static str) {
        let err = SessionError::RequestNotFound(request_id.to_string());
        tracing::warn!(worker_id = %self.worker_id, frame_type = kind, error = %err, "Dropping frame");
        metrics::record_frame_dropped("unknown_request");
    }

    fn notify_registry(&self, op: &'static str, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            tracing::warn!(worker_id = %self.worker_id, op, error = %e, "Registry update failed");
        }
    }
}

fn fail(state: RequestState, err: SessionError) {
    match state {
        RequestState::AwaitingHeaders(reply) => {
            let _ = reply.send(Err(err));
        }
        RequestState::Streaming(sink) => sink.fail(err),
        RequestState::Aborted => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryStore, WorkerRecord};
    use crate::session::bootstrap::InvokeFuture;
    use crate::session::handle::{ConnectionPeer, SessionHandle};
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Invoker that counts calls and finishes when told to.
    #[derive(Debug, Default)]
    struct StubInvoker {
        calls: AtomicUsize,
        release: Arc<Notify>,
        fail: bool,
    }

    impl WorkerInvoker for StubInvoker {
        fn invoke(&self, _initial: InitialRequest) -> InvokeFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            let release = self.release.clone();
            Box::pin(async move {
                release.notified().await;
                if fail {
                    Err(BootstrapError::Status(502))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn setup(records: Vec<WorkerRecord>, invoker: Arc<StubInvoker>) -> (Arc<Registry>, SessionHandle) {
        let store = Arc::new(MemoryStore::with_records(records));
        let registry = Arc::new(Registry::load(store, &Default::default()).unwrap());
        let handle = SessionHandle::spawn("w1", registry.clone(), invoker, SessionOptions::default());
        (registry, handle)
    }

    fn request(id: &str) -> IncomingRequest {
        IncomingRequest {
            request_id: id.to_string(),
            headers: Headers::new(),
            data: String::new(),
        }
    }

    fn initial(id: &str) -> InitialRequest {
        InitialRequest {
            request_id: id.to_string(),
            server_id: "w1".to_string(),
            host: "edge.local".to_string(),
        }
    }

    async fn connect(handle: &SessionHandle) -> ConnectionPeer {
        let (conn, peer) = Connection::pair();
        handle.accept_connection(conn).await.unwrap();
        peer
    }

    fn headers_frame(request_id: &str) -> WorkerFrame {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "text/plain".into());
        WorkerFrame::OutgoingHeaders {
            request_id: request_id.into(),
            server_id: "w1".into(),
            headers,
        }
    }

    fn data_frame(request_id: &str, data: &str) -> WorkerFrame {
        WorkerFrame::OutgoingData {
            request_id: request_id.into(),
            server_id: "w1".into(),
            data: data.into(),
        }
    }

    fn close_frame(request_id: &str) -> WorkerFrame {
        WorkerFrame::OutgoingClose {
            request_id: request_id.into(),
            server_id: "w1".into(),
        }
    }

    fn ready_frame() -> WorkerFrame {
        WorkerFrame::Ready { server_id: "w1".into() }
    }

    async fn read_body(response: WorkerResponse) -> String {
        let chunks: Vec<_> = response.body.collect().await;
        chunks
            .into_iter()
            .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_headers_then_body_then_close() {
        let (registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let pending = handle.admit_cold(request("r1"), initial("r1")).unwrap();
        let mut peer = connect(&handle).await;

        // Nothing is sent before `ready`
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.outbound.try_recv().is_err());

        peer.frames.send(ready_frame()).unwrap();
        let sent = peer.outbound.recv().await.unwrap();
        assert_eq!(sent, EdgeFrame::Incoming(request("r1")));

        peer.frames.send(headers_frame("r1")).unwrap();
        peer.frames.send(data_frame("r1", "hello")).unwrap();
        peer.frames.send(close_frame("r1")).unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(response.headers.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(read_body(response).await, "hello");
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Ready);
    }

    #[tokio::test]
    async fn test_unknown_request_frame_is_isolated() {
        let (_registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let pending = handle.admit(request("r1")).unwrap();
        peer.outbound.recv().await.unwrap();

        peer.frames.send(data_frame("unknown", "junk")).unwrap();
        peer.frames.send(close_frame("unknown")).unwrap();
        peer.frames.send(headers_frame("r1")).unwrap();
        peer.frames.send(data_frame("r1", "ok")).unwrap();
        peer.frames.send(close_frame("r1")).unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(read_body(response).await, "ok");
    }

    #[tokio::test]
    async fn test_data_before_headers_fails_only_that_request() {
        let (_registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let bad = handle.admit(request("bad")).unwrap();
        let good = handle.admit(request("good")).unwrap();
        peer.outbound.recv().await.unwrap();
        peer.outbound.recv().await.unwrap();

        peer.frames.send(data_frame("bad", "oops")).unwrap();
        peer.frames.send(headers_frame("good")).unwrap();
        peer.frames.send(close_frame("good")).unwrap();

        assert!(matches!(bad.wait().await, Err(SessionError::ProtocolViolation(_))));
        assert!(good.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_deletes_worker() {
        let (registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let waiting = handle.admit(request("r1")).unwrap();
        let streaming = handle.admit(request("r2")).unwrap();
        peer.outbound.recv().await.unwrap();
        peer.outbound.recv().await.unwrap();
        peer.frames.send(headers_frame("r2")).unwrap();
        let response = streaming.wait().await.unwrap();

        drop(peer);

        assert!(matches!(waiting.wait().await, Err(SessionError::ConnectionLost(_))));
        let chunks: Vec<_> = response.body.collect().await;
        assert!(matches!(chunks.last(), Some(Err(SessionError::ConnectionLost(_)))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get("w1").is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_releases_capacity() {
        let (registry, handle) = setup(
            vec![WorkerRecord {
                id: "w1".into(),
                active_connections: 2,
                status: WorkerStatus::Ready,
            }],
            Arc::default(),
        );
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let pending = handle.admit(request("r1")).unwrap();
        peer.outbound.recv().await.unwrap();
        peer.frames.send(headers_frame("r1")).unwrap();
        peer.frames.send(close_frame("r1")).unwrap();
        read_body(pending.wait().await.unwrap()).await;

        assert_eq!(registry.get("w1").unwrap().active_connections, 1);
    }

    #[tokio::test]
    async fn test_closing_rejects_new_requests() {
        let (registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();
        peer.frames.send(WorkerFrame::Closing { server_id: "w1".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Closing);
        let pending = handle.admit(request("late")).unwrap();
        assert!(matches!(pending.wait().await, Err(SessionError::WorkerClosing(_))));
    }

    #[tokio::test]
    async fn test_replacing_connection_fails_dispatched_requests() {
        let (_registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let mut old = connect(&handle).await;
        old.frames.send(ready_frame()).unwrap();
        let pending = handle.admit(request("r1")).unwrap();
        old.outbound.recv().await.unwrap();

        let (conn, _new_peer) = Connection::pair();
        let ack = handle.accept_connection(conn).await.unwrap();
        assert!(ack.replaced);
        assert_eq!(ack.generation, 2);

        assert!(matches!(pending.wait().await, Err(SessionError::ConnectionLost(_))));
        // Old outbound is dropped by the actor
        assert!(old.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let (_registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let _first = handle.admit_cold(request("r1"), initial("r1")).unwrap();
        let second = handle.admit(request("r1")).unwrap();
        assert!(matches!(second.wait().await, Err(SessionError::DuplicateRequest(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_is_single_flight() {
        let invoker = Arc::new(StubInvoker::default());
        let (_registry, handle) = setup(vec![WorkerRecord::pending("w1")], invoker.clone());

        let _p1 = handle.admit_cold(request("r1"), initial("r1")).unwrap();
        let _p2 = handle.admit_cold(request("r2"), initial("r2")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_bootstrap_resets_guard_and_fails_queued() {
        let invoker = Arc::new(StubInvoker {
            fail: true,
            ..Default::default()
        });
        let (registry, handle) = setup(vec![WorkerRecord::pending("w1")], invoker.clone());

        let p1 = handle.admit_cold(request("r1"), initial("r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        invoker.release.notify_waiters();

        assert!(matches!(p1.wait().await, Err(SessionError::BootstrapFailed(_))));
        assert!(registry.get("w1").is_none());

        // Nothing left to serve: the actor exits and a fresh one starts over
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_closed());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_overflow_aborts_request() {
        let store = Arc::new(MemoryStore::with_records(vec![WorkerRecord::pending("w1")]));
        let registry = Arc::new(Registry::load(store, &Default::default()).unwrap());
        let handle = SessionHandle::spawn(
            "w1",
            registry,
            Arc::new(StubInvoker::default()),
            SessionOptions { max_buffered_chunks: 2 },
        );
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let pending = handle.admit(request("r1")).unwrap();
        peer.outbound.recv().await.unwrap();
        peer.frames.send(headers_frame("r1")).unwrap();
        for chunk in ["a", "b", "c", "d"] {
            peer.frames.send(data_frame("r1", chunk)).unwrap();
        }
        peer.frames.send(close_frame("r1")).unwrap();

        let response = pending.wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let chunks: Vec<_> = response.body.collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[2], Err(SessionError::BodyOverflow)));
    }

    #[tokio::test]
    async fn test_admit_to_unconnected_worker_fails_fast() {
        // A persisted record that outlived its worker's connection.
        let invoker = Arc::new(StubInvoker::default());
        let (registry, handle) = setup(
            vec![WorkerRecord {
                id: "w1".into(),
                active_connections: 1,
                status: WorkerStatus::Ready,
            }],
            invoker.clone(),
        );

        let pending = handle.admit(request("r1")).unwrap();
        assert!(matches!(pending.wait().await, Err(SessionError::WorkerUnavailable(_))));
        assert!(registry.get("w1").is_none());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_queued_request_never_reaches_worker() {
        let (_registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let pending = handle.admit_cold(request("r1"), initial("r1")).unwrap();
        let _kept = handle.admit(request("r2")).unwrap();

        assert_eq!(handle.cancel("r1").await, CancelOutcome::Dequeued);
        assert_eq!(handle.cancel("r1").await, CancelOutcome::Unknown);
        assert!(matches!(pending.wait().await, Err(SessionError::ActorStopped)));

        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();
        assert_eq!(peer.outbound.recv().await.unwrap(), EdgeFrame::Incoming(request("r2")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_dispatched_request_still_releases_on_close() {
        let (registry, handle) = setup(
            vec![WorkerRecord {
                id: "w1".into(),
                active_connections: 1,
                status: WorkerStatus::Ready,
            }],
            Arc::default(),
        );
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let pending = handle.admit(request("r1")).unwrap();
        peer.outbound.recv().await.unwrap();
        assert_eq!(handle.cancel("r1").await, CancelOutcome::Abandoned);
        drop(pending);

        peer.frames.send(headers_frame("r1")).unwrap();
        peer.frames.send(data_frame("r1", "late")).unwrap();
        peer.frames.send(close_frame("r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.get("w1").unwrap().active_connections, 0);
    }

    #[tokio::test]
    async fn test_unanswered_requests_retryable_after_closing() {
        let (registry, handle) = setup(vec![WorkerRecord::pending("w1")], Arc::default());
        let mut peer = connect(&handle).await;
        peer.frames.send(ready_frame()).unwrap();

        let unread = handle.admit(request("r1")).unwrap();
        let served = handle.admit(request("r2")).unwrap();
        peer.outbound.recv().await.unwrap();
        peer.outbound.recv().await.unwrap();
        peer.frames.send(headers_frame("r2")).unwrap();
        let response = served.wait().await.unwrap();

        // The worker went idle-closed before reading r1.
        peer.frames.send(WorkerFrame::Closing { server_id: "w1".into() }).unwrap();
        drop(peer);

        assert!(matches!(unread.wait().await, Err(SessionError::WorkerClosing(_))));
        let chunks: Vec<_> = response.body.collect().await;
        assert!(matches!(chunks.last(), Some(Err(SessionError::ConnectionLost(_)))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get("w1").is_none());
    }
}
