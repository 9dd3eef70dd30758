//! Invocation endpoint of the worker process.
//!
//! `POST /invoke` takes the `initial` frame, runs one worker instance until
//! its duplex connection ends, then answers. The response therefore lasts
//! as long as the worker, like a function invocation.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::WorkerConfig;
use crate::protocol::EdgeFrame;
use crate::worker::handler::RequestHandler;
use crate::worker::runtime::run_worker;

struct InvokeState<H> {
    config: WorkerConfig,
    handler: Arc<H>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeResponse {
    server_id: String,
    exit_reason: Option<String>,
    error: Option<String>,
}

/// HTTP server hosting the invocation endpoint.
pub struct WorkerServer {
    router: Router,
}

impl WorkerServer {
    pub fn new<H: RequestHandler>(config: WorkerConfig, handler: Arc<H>) -> Self {
        let state = Arc::new(InvokeState { config, handler });
        let router = Router::new()
            .route("/invoke", post(invoke_handler::<H>))
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        Self { router }
    }

    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Worker invocation server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("Worker invocation server stopped");
        Ok(())
    }
}

async fn invoke_handler<H: RequestHandler>(
    State(state): State<Arc<InvokeState<H>>>,
    Json(frame): Json<EdgeFrame>,
) -> Response {
    let EdgeFrame::Initial(initial) = frame else {
        return (StatusCode::BAD_REQUEST, "expected an initial frame").into_response();
    };
    let server_id = initial.server_id.clone();
    tracing::info!(
        server_id = %server_id,
        request_id = %initial.request_id,
        host = %initial.host,
        "Worker invoked"
    );

    match run_worker(&state.config, initial, state.handler.clone()).await {
        Ok(reason) => Json(InvokeResponse {
            server_id,
            exit_reason: Some(reason.to_string()),
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(server_id = %server_id, error = %e, "Worker failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(InvokeResponse {
                    server_id,
                    exit_reason: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}
