//! Worker-side demultiplexer: one duplex connection, many output streams.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::LifecycleConfig;
use crate::protocol::{EdgeFrame, Headers, IncomingRequest, WorkerFrame, STATUS_PSEUDO_HEADER};
use crate::worker::handler::RequestHandler;
use crate::worker::lifecycle::LifecycleTimers;
use crate::worker::stream::OutputStream;

/// Why the demultiplexer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No stream was open for the whole grace period.
    Idle,
    /// The hard ceiling fired and every open stream has finished.
    HardLimit,
    /// The edge closed the connection.
    ConnectionClosed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Idle => write!(f, "idle"),
            ExitReason::HardLimit => write!(f, "hard-limit"),
            ExitReason::ConnectionClosed => write!(f, "connection-closed"),
        }
    }
}

pub struct Demultiplexer<H> {
    server_id: Arc<str>,
    handler: Arc<H>,
    lifecycle: LifecycleConfig,
}

impl<H: RequestHandler> Demultiplexer<H> {
    pub fn new(server_id: &str, handler: Arc<H>, lifecycle: LifecycleConfig) -> Self {
        Self {
            server_id: Arc::from(server_id),
            handler,
            lifecycle,
        }
    }

    /// Serve frames from `inbound` until the worker decides to stop.
    ///
    /// Announces `ready` first and `closing` before leaving on a timer.
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<EdgeFrame>,
        outbound: mpsc::UnboundedSender<WorkerFrame>,
    ) -> ExitReason {
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<String>();
        let mut timers = LifecycleTimers::start(&self.lifecycle);
        let mut open: HashSet<String> = HashSet::new();
        let mut draining = false;

        let _ = outbound.send(WorkerFrame::Ready {
            server_id: self.server_id.to_string(),
        });
        tracing::info!(server_id = %self.server_id, "Worker ready");

        let reason = loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        break ExitReason::ConnectionClosed;
                    };
                    match frame {
                        EdgeFrame::Incoming(request) if draining => {
                            tracing::debug!(request_id = %request.request_id, "Draining, rejecting request");
                            self.reject(&outbound, request);
                        }
                        EdgeFrame::Incoming(request) => {
                            if !open.insert(request.request_id.clone()) {
                                tracing::warn!(request_id = %request.request_id, "Duplicate request id dropped");
                                continue;
                            }
                            timers.cancel_idle();
                            self.spawn_handler(request, &outbound, &finished_tx);
                        }
                        EdgeFrame::Initial(initial) => {
                            tracing::warn!(request_id = %initial.request_id, "Unexpected initial frame on duplex connection");
                        }
                    }
                }
                Some(request_id) = finished_rx.recv() => {
                    open.remove(&request_id);
                    tracing::debug!(request_id = %request_id, open = open.len(), "Stream finished");
                    if open.is_empty() {
                        if draining {
                            break ExitReason::HardLimit;
                        }
                        timers.arm_idle();
                    }
                }
                _ = timers.idle_expired(), if !draining && open.is_empty() => {
                    tracing::info!(server_id = %self.server_id, "Idle grace elapsed, closing");
                    self.announce_closing(&outbound);
                    break ExitReason::Idle;
                }
                _ = timers.hard_expired(), if !draining => {
                    tracing::info!(server_id = %self.server_id, open = open.len(), "Hard lifetime reached, draining");
                    self.announce_closing(&outbound);
                    if open.is_empty() {
                        break ExitReason::HardLimit;
                    }
                    draining = true;
                }
            }
        };

        tracing::info!(server_id = %self.server_id, reason = %reason, "Demultiplexer stopped");
        reason
    }

    fn spawn_handler(
        &self,
        request: IncomingRequest,
        outbound: &mpsc::UnboundedSender<WorkerFrame>,
        finished: &mpsc::UnboundedSender<String>,
    ) {
        let request_id = request.request_id.clone();
        let stream = OutputStream::new(
            request_id.clone(),
            self.server_id.clone(),
            outbound.clone(),
            finished.clone(),
        );
        let handler = self.handler.clone();
        tracing::debug!(request_id = %request_id, "Dispatching request to handler");

        tokio::spawn(async move {
            // The stream is consumed by the handler; dropping it ends the response.
            if let Err(e) = handler.handle(request, stream).await {
                tracing::warn!(request_id = %request_id, error = %e, "Handler failed");
            }
        });
    }

    /// Answer a request with 503 without running the handler.
    fn reject(&self, outbound: &mpsc::UnboundedSender<WorkerFrame>, request: IncomingRequest) {
        let mut headers = Headers::new();
        headers.insert(STATUS_PSEUDO_HEADER.to_string(), "503".to_string());
        let _ = outbound.send(WorkerFrame::OutgoingHeaders {
            request_id: request.request_id.clone(),
            server_id: self.server_id.to_string(),
            headers,
        });
        let _ = outbound.send(WorkerFrame::OutgoingClose {
            request_id: request.request_id,
            server_id: self.server_id.to_string(),
        });
    }

    fn announce_closing(&self, outbound: &mpsc::UnboundedSender<WorkerFrame>) {
        let _ = outbound.send(WorkerFrame::Closing {
            server_id: self.server_id.to_string(),
        });
    }
}
