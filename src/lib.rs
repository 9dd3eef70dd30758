//! Duplex Router Library
//!
//! An edge router that multiplexes HTTP requests over one websocket per
//! backend worker, plus the worker-side demultiplexer.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod session;
pub mod worker;

pub use config::schema::{RouterConfig, WorkerConfig};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use registry::Registry;
pub use worker::WorkerServer;
