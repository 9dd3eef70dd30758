//! Bridges an upgraded worker websocket to its session actor.
//!
//! # Responsibilities
//! - Decode text messages into `WorkerFrame`s and feed the actor
//! - Encode `EdgeFrame`s from the actor as text messages
//! - Signal disconnect by dropping the frame sender

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use crate::observability::metrics;
use crate::protocol::{ProtocolError, WorkerFrame};
use crate::session::handle::{Connection, SessionHandle};

/// Run one worker connection until either side closes it.
pub async fn serve_socket(handle: SessionHandle, socket: WebSocket) {
    let worker_id = handle.worker_id().to_string();
    let (conn, mut peer) = Connection::pair();

    let ack = match handle.accept_connection(conn).await {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(worker_id = %worker_id, error = %e, "Session refused connection");
            return;
        }
    };
    tracing::debug!(worker_id = %worker_id, generation = ack.generation, replaced = ack.replaced, "Duplex connection open");

    let (mut sink, mut stream) = socket.split();

    let writer_id = worker_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = peer.outbound.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(worker_id = %writer_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        // The actor dropped this link (replaced or shutting down).
        let _ = sink.close().await;
    });

    let frames = peer.frames;
    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Websocket read error");
                        break;
                    }
                };
                match decode_message(msg) {
                    Ok(Some(frame)) => {
                        if frames.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Dropping undecodable frame");
                        metrics::record_frame_dropped("malformed");
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    drop(frames);
    writer.abort();
    tracing::debug!(worker_id = %worker_id, generation = ack.generation, "Duplex connection closed");
}

/// Turn one websocket message into a frame.
///
/// A close message carrying a frame as its reason is treated as that frame,
/// so a worker can announce `closing` while shutting the socket.
fn decode_message(msg: Message) -> Result<Option<WorkerFrame>, ProtocolError> {
    match msg {
        Message::Text(text) => WorkerFrame::decode(text.as_str()).map(Some),
        Message::Binary(bytes) => Err(ProtocolError::Binary(bytes.len())),
        Message::Close(Some(CloseFrame { reason, .. })) if !reason.is_empty() => {
            Ok(WorkerFrame::decode(reason.as_str()).ok())
        }
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => Ok(None),
    }
}
