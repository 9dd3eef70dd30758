//! Response bridging: headers resolve once, the body arrives as a stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::Headers;
use crate::session::SessionError;

/// Response reconstructed from a worker's frames.
#[derive(Debug)]
pub struct WorkerResponse {
    pub headers: Headers,
    pub body: ResponseBody,
}

/// Lazily produced response body fed by `outgoing-data` frames.
///
/// Ends when the worker sends `outgoing-close`. Yields an error item if the
/// request failed after headers were delivered.
#[derive(Debug)]
pub struct ResponseBody {
    rx: mpsc::Receiver<Result<Bytes, SessionError>>,
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Outcome of pushing a chunk into a body sink.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Push {
    Accepted,
    /// The consumer is gone; nothing more will be read.
    Closed,
    /// The buffer bound was hit; the body now ends with `BodyOverflow`.
    Overflowed,
}

/// Producer side of a [`ResponseBody`].
///
/// One slot of the channel is reserved so an overflow can always be reported.
#[derive(Debug)]
pub(crate) struct BodySink {
    tx: mpsc::Sender<Result<Bytes, SessionError>>,
}

pub(crate) fn body_channel(max_chunks: usize) -> (BodySink, ResponseBody) {
    let (tx, rx) = mpsc::channel(max_chunks.max(1) + 1);
    (BodySink { tx }, ResponseBody { rx })
}

impl BodySink {
    pub(crate) fn push(&self, chunk: Bytes) -> Push {
        if self.tx.is_closed() {
            return Push::Closed;
        }
        if self.tx.capacity() <= 1 {
            let _ = self.tx.try_send(Err(SessionError::BodyOverflow));
            return Push::Overflowed;
        }
        match self.tx.try_send(Ok(chunk)) {
            Ok(()) => Push::Accepted,
            Err(TrySendError::Closed(_)) => Push::Closed,
            Err(TrySendError::Full(_)) => Push::Overflowed,
        }
    }

    /// End the body with an error instead of a clean close.
    pub(crate) fn fail(self, err: SessionError) {
        let _ = self.tx.try_send(Err(err));
    }
}
