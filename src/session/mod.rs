//! Worker session actors: one per worker id, owning its duplex connection.
//!
//! # Data Flow
//! ```text
//! Dispatcher                 SessionHandle            SessionActor (one task per worker id)
//!   admit(request)   ──────▶  Command::Admit   ──────▶  register RequestSession
//!   admit_cold(request, initial)                        queue until `ready`, then send `incoming`
//!                                                       cold: at most one in-flight invocation
//!   cancel(request_id) ─────▶ Command::Cancel  ──────▶  forget a request the caller gave up on
//!
//! Worker websocket ─▶ transport.rs ─▶ Command::Accept ─▶ owns Connection (replaces old)
//!                                   ─▶ WorkerFrame    ─▶ frame state machine
//!                                                        ├─ outgoing-headers → resolve PendingResponse
//!                                                        ├─ outgoing-data    → body channel
//!                                                        └─ outgoing-close   → end body, release capacity
//! ```
//!
//! # Design Decisions
//! - All state of one worker id lives in one task; no locks around it
//! - Connection replacement is explicit: the actor drops the old link
//! - Per-request body channels are bounded; overflow aborts only that request

pub mod actor;
pub mod body;
pub mod bootstrap;
pub mod directory;
pub mod handle;
pub mod transport;

use thiserror::Error;

pub use body::{ResponseBody, WorkerResponse};
pub use bootstrap::{BootstrapError, HttpInvoker, InvokeFuture, WorkerInvoker};
pub use directory::SessionDirectory;
pub use handle::{
    CancelOutcome, Connection, ConnectionPeer, PendingResponse, SessionHandle, SessionOptions, UpgradeAck,
};

/// Errors surfaced by a worker session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A frame referenced a request id this session does not know.
    #[error("request not found: {0}")]
    RequestNotFound(String),

    /// A request id was admitted twice.
    #[error("request already admitted: {0}")]
    DuplicateRequest(String),

    /// The duplex connection closed while the request was pending.
    #[error("connection to worker {0} lost")]
    ConnectionLost(String),

    /// The worker announced it is closing and takes no new requests.
    #[error("worker {0} is closing")]
    WorkerClosing(String),

    /// The worker has no connection and none is being started.
    #[error("worker {0} is not connected")]
    WorkerUnavailable(String),

    /// The client consumed the body slower than the worker produced it.
    #[error("response body buffer overflowed")]
    BodyOverflow,

    /// The worker broke the headers → data → close ordering.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The worker process could not be started.
    #[error("worker bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// The session actor is no longer running.
    #[error("session actor stopped")]
    ActorStopped,
}
