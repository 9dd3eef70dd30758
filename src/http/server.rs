//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, body limit, request ID)
//! - Accept worker connections on the upgrade path
//! - Dispatch every other request onto a worker session
//! - Stream worker responses back to clients

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin::setup_admin_router;
use crate::config::RouterConfig;
use crate::http::dispatcher::{DispatchError, Dispatcher};
use crate::http::{request, response, websocket};
use crate::observability::metrics;
use crate::protocol::UPGRADE_PATH;
use crate::registry::Registry;
use crate::session::{SessionDirectory, SessionOptions, WorkerInvoker};

/// How often exited session actors are swept from the directory.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionDirectory>,
    pub registry: Arc<Registry>,
    pub config: Arc<RouterConfig>,
}

/// HTTP server for the edge router.
pub struct HttpServer {
    router: Router,
    sessions: Arc<SessionDirectory>,
}

impl HttpServer {
    /// Create a new HTTP server over a loaded registry.
    pub fn new(config: RouterConfig, registry: Arc<Registry>, invoker: Arc<dyn WorkerInvoker>) -> Self {
        let options = SessionOptions {
            max_buffered_chunks: config.pool.max_buffered_chunks,
        };
        let sessions = Arc::new(SessionDirectory::new(registry.clone(), invoker, options));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            sessions.clone(),
            Duration::from_secs(config.timeouts.admit_secs),
            config.bootstrap.public_host.clone(),
        ));

        let state = AppState {
            dispatcher,
            sessions: sessions.clone(),
            registry,
            config: Arc::new(config),
        };

        let router = Self::build_router(state);
        Self { router, sessions }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        let config = state.config.clone();

        let mut router = Router::new().route(UPGRADE_PATH, get(websocket::upgrade_handler));
        if config.admin.enabled {
            router = router.merge(setup_admin_router(state.clone()));
        }

        router
            .fallback(dispatch_handler)
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.limits.max_body_size))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let sessions = self.sessions.clone();
        let pruner = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                sessions.prune();
            }
        });

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        pruner.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the session directory.
    pub fn sessions(&self) -> &Arc<SessionDirectory> {
        &self.sessions
    }
}

/// Forward a client request to a worker and stream its answer back.
async fn dispatch_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let request_id = request::request_id(request.headers());
    let host = request::host(request.headers()).unwrap_or_else(|| state.config.listener.bind_address.clone());

    tracing::debug!(
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        "Dispatching request"
    );

    let incoming = match request::into_incoming(request, request_id.clone(), state.config.limits.max_body_size).await {
        Ok(incoming) => incoming,
        Err(e) => {
            let error = DispatchError::from(e);
            metrics::record_request(error.status().as_u16(), start_time);
            return error.into_response();
        }
    };

    match state.dispatcher.dispatch(incoming, &host).await {
        Ok(worker) => {
            let response = response::into_response(&request_id, worker);
            metrics::record_request(response.status().as_u16(), start_time);
            response
        }
        Err(e) => {
            let status = e.status();
            tracing::warn!(request_id = %request_id, status = %status, error = %e, "Dispatch failed");
            metrics::record_request(status.as_u16(), start_time);
            e.into_response()
        }
    }
}
