//! Worker process runtime: dial the edge and pump frames through the demultiplexer.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::config::WorkerConfig;
use crate::protocol::{EdgeFrame, InitialRequest, WorkerFrame, SERVER_ID_HEADER, UPGRADE_PATH};
use crate::resilience::backoff::ConnectBackoff;
use crate::worker::demux::{Demultiplexer, ExitReason};
use crate::worker::handler::RequestHandler;
use crate::worker::WorkerError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// URL the worker dials for its duplex connection.
pub fn connect_url(host: &str) -> String {
    format!("ws://{}{}", host, UPGRADE_PATH)
}

/// Open the duplex connection, retrying with backoff.
pub async fn connect(config: &WorkerConfig, initial: &InitialRequest) -> Result<Socket, WorkerError> {
    let url = connect_url(&initial.host);
    let server_id = HeaderValue::from_str(&initial.server_id)
        .map_err(|_| WorkerError::InvalidServerId(initial.server_id.clone()))?;

    let backoff = ConnectBackoff::from(config);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| WorkerError::Connect {
                url: url.clone(),
                attempts: attempt,
                source: Box::new(e),
            })?;
        request.headers_mut().insert(SERVER_ID_HEADER, server_id.clone());

        match connect_async(request).await {
            Ok((socket, _response)) => {
                tracing::info!(url = %url, server_id = %initial.server_id, attempt, "Connected to edge");
                return Ok(socket);
            }
            Err(e) if attempt < config.connect_attempts => {
                let delay = backoff.delay(attempt);
                tracing::warn!(url = %url, attempt, delay = ?delay, error = %e, "Connect failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(WorkerError::Connect {
                    url,
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
        }
    }
}

/// Run one worker instance for the lifetime of its duplex connection.
pub async fn run_worker<H: RequestHandler>(
    config: &WorkerConfig,
    initial: InitialRequest,
    handler: Arc<H>,
) -> Result<ExitReason, WorkerError> {
    let socket = connect(config, &initial).await?;
    let (mut sink, mut stream) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<EdgeFrame>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerFrame>();

    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Duplex read error");
                    break;
                }
            };
            match EdgeFrame::decode(text.as_str()) {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Dropping undecodable frame"),
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                tracing::warn!(error = %e, "Duplex write error");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let demux = Demultiplexer::new(&initial.server_id, handler, config.lifecycle.clone());
    let reason = demux.run(inbound_rx, outbound_tx).await;

    // Every stream has finished (or the edge is gone), so the writer drains and closes.
    if reason == ExitReason::ConnectionClosed {
        writer.abort();
    } else if let Err(e) = writer.await {
        tracing::warn!(error = %e, "Writer task failed");
    }
    reader.abort();

    Ok(reason)
}
