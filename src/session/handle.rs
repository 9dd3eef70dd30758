//! Handle used by the dispatcher and the websocket transport to talk to a
//! session actor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::protocol::{EdgeFrame, IncomingRequest, InitialRequest, WorkerFrame};
use crate::registry::Registry;
use crate::session::actor::SessionActor;
use crate::session::bootstrap::{BootstrapError, WorkerInvoker};
use crate::session::body::WorkerResponse;
use crate::session::SessionError;

pub(crate) type ResponseReply = oneshot::Sender<Result<WorkerResponse, SessionError>>;

/// Internal command sent from SessionHandle → SessionActor via mpsc.
pub(crate) enum Command {
    Admit {
        request: IncomingRequest,
        bootstrap: Option<InitialRequest>,
        reply: ResponseReply,
    },
    Cancel {
        request_id: String,
        reply: oneshot::Sender<CancelOutcome>,
    },
    BootstrapFinished {
        result: Result<(), BootstrapError>,
    },
    Accept {
        connection: Connection,
        reply: oneshot::Sender<UpgradeAck>,
    },
}

/// Tunables of a session actor.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Body chunks buffered per request before it is aborted.
    pub max_buffered_chunks: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_buffered_chunks: 1024,
        }
    }
}

/// Edge-side ends of one duplex connection, owned by the session actor.
#[derive(Debug)]
pub struct Connection {
    pub(crate) outbound: mpsc::UnboundedSender<EdgeFrame>,
    pub(crate) inbound: mpsc::UnboundedReceiver<WorkerFrame>,
}

/// Transport-side ends of a [`Connection`].
///
/// Frames received from the worker go into `frames`; dropping it signals that
/// the connection closed. Frames for the worker come out of `outbound`.
#[derive(Debug)]
pub struct ConnectionPeer {
    pub frames: mpsc::UnboundedSender<WorkerFrame>,
    pub outbound: mpsc::UnboundedReceiver<EdgeFrame>,
}

impl Connection {
    /// Create a connection and the transport's ends of it.
    pub fn pair() -> (Connection, ConnectionPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outbound: outbound_tx,
                inbound: frames_rx,
            },
            ConnectionPeer {
                frames: frames_tx,
                outbound: outbound_rx,
            },
        )
    }
}

/// Acknowledgment returned once a session owns a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeAck {
    pub worker_id: String,
    /// Increases every time the worker's connection is replaced.
    pub generation: u64,
    /// True if an older connection was dropped in favour of this one.
    pub replaced: bool,
}

/// What became of a request its caller stopped waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Still queued; the worker never saw it.
    Dequeued,
    /// Already sent to the worker; its close releases capacity as usual.
    Abandoned,
    /// Already finished or failed.
    Unknown,
}

/// A response that resolves when the worker sends `outgoing-headers`.
#[derive(Debug)]
pub struct PendingResponse {
    pub request_id: String,
    rx: oneshot::Receiver<Result<WorkerResponse, SessionError>>,
}

impl PendingResponse {
    pub async fn wait(self) -> Result<WorkerResponse, SessionError> {
        self.rx.await.map_err(|_| SessionError::ActorStopped)?
    }
}

/// Cloneable handle to the actor of one worker id.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    worker_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Spawn the actor for `worker_id` on the current runtime.
    pub fn spawn(
        worker_id: &str,
        registry: Arc<Registry>,
        invoker: Arc<dyn WorkerInvoker>,
        options: SessionOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(worker_id.to_string(), registry, invoker, options, rx, tx.downgrade());
        tokio::spawn(actor.run());
        Self {
            worker_id: Arc::from(worker_id),
            commands: tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// True once the actor has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Register a request with a worker that is connected or connecting.
    ///
    /// The `incoming` frame goes out as soon as the worker is ready; the
    /// returned future resolves on the matching `outgoing-headers`. Fails
    /// with `WorkerUnavailable` if the worker has no connection and no
    /// start in flight.
    pub fn admit(&self, request: IncomingRequest) -> Result<PendingResponse, SessionError> {
        self.send_admit(request, None)
    }

    /// Register a request and start the worker process unless a start is
    /// already in flight.
    pub fn admit_cold(&self, request: IncomingRequest, initial: InitialRequest) -> Result<PendingResponse, SessionError> {
        self.send_admit(request, Some(initial))
    }

    fn send_admit(
        &self,
        request: IncomingRequest,
        bootstrap: Option<InitialRequest>,
    ) -> Result<PendingResponse, SessionError> {
        let (reply, rx) = oneshot::channel();
        let request_id = request.request_id.clone();
        self.commands
            .send(Command::Admit {
                request,
                bootstrap,
                reply,
            })
            .map_err(|_| SessionError::ActorStopped)?;
        Ok(PendingResponse { request_id, rx })
    }

    /// Stop tracking a request whose caller gave up.
    pub async fn cancel(&self, request_id: &str) -> CancelOutcome {
        let (reply, rx) = oneshot::channel();
        let command = Command::Cancel {
            request_id: request_id.to_string(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return CancelOutcome::Unknown;
        }
        rx.await.unwrap_or(CancelOutcome::Unknown)
    }

    /// Hand a freshly upgraded duplex connection to the actor.
    pub async fn accept_connection(&self, connection: Connection) -> Result<UpgradeAck, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Accept { connection, reply })
            .map_err(|_| SessionError::ActorStopped)?;
        rx.await.map_err(|_| SessionError::ActorStopped)
    }
}
