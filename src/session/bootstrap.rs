//! Cold start: hand the `initial` payload to the worker launcher.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::config::BootstrapConfig;
use crate::protocol::{EdgeFrame, InitialRequest, ProtocolError};

/// Future resolving when the worker invocation ends.
pub type InvokeFuture = Pin<Box<dyn Future<Output = Result<(), BootstrapError>> + Send>>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to encode initial frame: {0}")]
    Encode(#[from] ProtocolError),

    #[error("invocation request failed: {0}")]
    Request(String),

    #[error("invocation returned status {0}")]
    Status(u16),

    #[error("invocation timed out after {0}s")]
    Timeout(u64),
}

/// Starts a worker process for a worker id.
///
/// The returned future lives as long as the invocation; the worker dials
/// back on its own once started.
pub trait WorkerInvoker: Send + Sync + std::fmt::Debug {
    fn invoke(&self, initial: InitialRequest) -> InvokeFuture;
}

/// Invokes workers by POSTing the `initial` frame to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: Client<HttpConnector, Body>,
    invoke_url: String,
    timeout: Duration,
}

impl HttpInvoker {
    pub fn new(config: &BootstrapConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            invoke_url: config.invoke_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl WorkerInvoker for HttpInvoker {
    fn invoke(&self, initial: InitialRequest) -> InvokeFuture {
        let client = self.client.clone();
        let url = self.invoke_url.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let body = EdgeFrame::Initial(initial).encode()?;
            let req = Request::builder()
                .method(Method::POST)
                .uri(&url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .map_err(|e| BootstrapError::Request(e.to_string()))?;

            tracing::debug!(url = %url, "Invoking worker");
            let response = tokio::time::timeout(timeout, client.request(req))
                .await
                .map_err(|_| BootstrapError::Timeout(timeout.as_secs()))?
                .map_err(|e| BootstrapError::Request(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(BootstrapError::Status(status.as_u16()))
            }
        })
    }
}
