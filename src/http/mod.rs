//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Client request
//!     → server.rs (Axum setup, request id, body limit, tracing)
//!     → request.rs (headers + pseudo headers + body → `incoming` frame)
//!     → dispatcher.rs (registry acquire / cold start, session admit)
//!     → response.rs (status, headers, streamed body)
//!     → Send to client
//!
//! Worker connection
//!     → websocket.rs (upgrade on /websocket, x-server-id)
//!     → session transport
//! ```

pub mod dispatcher;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use dispatcher::{DispatchError, Dispatcher};
pub use server::{AppState, HttpServer};
