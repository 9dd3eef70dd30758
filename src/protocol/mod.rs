//! Wire protocol shared by the edge and the backend workers.
//!
//! # Data Flow
//! ```text
//! Edge                                     Worker
//!   ── initial (out-of-band invocation) ──▶  cold start
//!   ◀──────────────── ready ───────────────  duplex connection open
//!   ───────────── incoming ───────────────▶  one per request id
//!   ◀──────────── outgoing-headers ────────  exactly once, first
//!   ◀──────────── outgoing-data ───────────  zero or more
//!   ◀──────────── outgoing-close ──────────  exactly once, last
//!   ◀──────────────── closing ─────────────  worker is going away
//! ```
//!
//! Every frame is one JSON text message tagged by `type`. Ordering is only
//! guaranteed per request id.

pub mod frame;

pub use frame::{
    EdgeFrame, Headers, IncomingRequest, InitialRequest, ProtocolError, WorkerFrame,
};

/// Path on which workers open their duplex connection.
pub const UPGRADE_PATH: &str = "/websocket";

/// Header carrying the worker id on the upgrade request.
pub const SERVER_ID_HEADER: &str = "x-server-id";

/// Header carrying the request id through the edge.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Pseudo header a worker sets to choose the response status.
pub const STATUS_PSEUDO_HEADER: &str = ":status";

/// Pseudo header carrying the client request method.
pub const METHOD_PSEUDO_HEADER: &str = ":method";

/// Pseudo header carrying the client request path and query.
pub const PATH_PSEUDO_HEADER: &str = ":path";
