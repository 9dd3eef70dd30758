//! Per-request output stream handed to request handlers.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::{Headers, WorkerFrame, STATUS_PSEUDO_HEADER};

/// Misuse of an [`OutputStream`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("headers already sent")]
    HeadersAlreadySent,

    #[error("headers not sent")]
    HeadersNotSent,

    #[error("stream already ended")]
    Ended,

    #[error("duplex connection closed")]
    ConnectionClosed,
}

/// Writable response channel for one request id.
///
/// Headers must be written exactly once before any body chunk. Ending the
/// stream, explicitly or by dropping it, sends `outgoing-close`; a stream
/// ended without headers first reports a 500.
#[derive(Debug)]
pub struct OutputStream {
    request_id: String,
    server_id: Arc<str>,
    frames: mpsc::UnboundedSender<WorkerFrame>,
    finished: mpsc::UnboundedSender<String>,
    headers_sent: bool,
    ended: bool,
}

impl OutputStream {
    pub(crate) fn new(
        request_id: String,
        server_id: Arc<str>,
        frames: mpsc::UnboundedSender<WorkerFrame>,
        finished: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            request_id,
            server_id,
            frames,
            finished,
            headers_sent: false,
            ended: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn write_headers(&mut self, headers: Headers) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::Ended);
        }
        if self.headers_sent {
            return Err(StreamError::HeadersAlreadySent);
        }
        self.headers_sent = true;
        self.send(WorkerFrame::OutgoingHeaders {
            request_id: self.request_id.clone(),
            server_id: self.server_id.to_string(),
            headers,
        })
    }

    pub fn write(&mut self, chunk: impl Into<String>) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::Ended);
        }
        if !self.headers_sent {
            return Err(StreamError::HeadersNotSent);
        }
        self.send(WorkerFrame::OutgoingData {
            request_id: self.request_id.clone(),
            server_id: self.server_id.to_string(),
            data: chunk.into(),
        })
    }

    /// Send `outgoing-close` and release the stream.
    pub fn end(mut self) -> Result<(), StreamError> {
        self.finish()
    }

    /// Write a final chunk, then end.
    pub fn end_with(mut self, chunk: impl Into<String>) -> Result<(), StreamError> {
        self.write(chunk)?;
        self.finish()
    }

    fn send(&self, frame: WorkerFrame) -> Result<(), StreamError> {
        self.frames.send(frame).map_err(|_| StreamError::ConnectionClosed)
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::Ended);
        }
        self.ended = true;

        let mut result = Ok(());
        if !self.headers_sent {
            tracing::warn!(request_id = %self.request_id, "Stream ended without headers, sending 500");
            self.headers_sent = true;
            let mut headers = Headers::new();
            headers.insert(STATUS_PSEUDO_HEADER.to_string(), "500".to_string());
            result = self.send(WorkerFrame::OutgoingHeaders {
                request_id: self.request_id.clone(),
                server_id: self.server_id.to_string(),
                headers,
            });
        }

        let closed = self.send(WorkerFrame::OutgoingClose {
            request_id: self.request_id.clone(),
            server_id: self.server_id.to_string(),
        });
        let _ = self.finished.send(self.request_id.clone());
        result.and(closed)
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.finish();
        }
    }
}
