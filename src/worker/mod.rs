//! Backend worker: turns one duplex connection into many output streams.
//!
//! # Data Flow
//! ```text
//! POST /invoke {initial}
//!     → server.rs (invocation endpoint)
//!     → runtime.rs (dial ws://{host}/websocket with x-server-id, backoff)
//!     → demux.rs (send `ready`, one OutputStream per `incoming`)
//!         → handler.rs (application logic writes headers, data, close)
//!         → stream.rs (enforces headers → data → close)
//!     → lifecycle.rs (idle grace / hard ceiling) → `closing`
//! ```
//!
//! # Design Decisions
//! - The demultiplexer only sees channels; the websocket lives in runtime.rs
//! - A stream dropped without headers answers 500 before closing
//! - While draining after the hard ceiling, new requests are answered 503
//! - An `incoming` frame still in flight when the idle grace elapses is never
//!   read. The worker has already sent `closing`, so the edge fails that
//!   request with `WorkerClosing` and routes it to another worker

pub mod demux;
pub mod handler;
pub mod lifecycle;
pub mod runtime;
pub mod server;
pub mod stream;

use thiserror::Error;

pub use demux::{Demultiplexer, ExitReason};
pub use handler::{EchoHandler, HandlerFuture, RequestHandler};
pub use runtime::run_worker;
pub use server::WorkerServer;
pub use stream::{OutputStream, StreamError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to {url} after {attempts} attempt(s): {source}")]
    Connect {
        url: String,
        attempts: u32,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("server id is not a valid header value: {0}")]
    InvalidServerId(String),
}
