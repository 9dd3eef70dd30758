//! Request handlers run by the worker for each `incoming` frame.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::protocol::{Headers, IncomingRequest, METHOD_PSEUDO_HEADER, PATH_PSEUDO_HEADER};
use crate::worker::stream::{OutputStream, StreamError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send>>;

/// Application logic answering one request on its own output stream.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: IncomingRequest, stream: OutputStream) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(IncomingRequest, OutputStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StreamError>> + Send + 'static,
{
    fn handle(&self, request: IncomingRequest, stream: OutputStream) -> HandlerFuture {
        Box::pin(self(request, stream))
    }
}

/// Demo handler: streams an event-stream body describing the request.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    instance_id: String,
    interval: Duration,
    ticks: u32,
}

impl EchoHandler {
    pub fn new(interval: Duration, ticks: u32) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            interval,
            ticks,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 3)
    }
}

impl RequestHandler for EchoHandler {
    fn handle(&self, request: IncomingRequest, mut stream: OutputStream) -> HandlerFuture {
        let this = self.clone();
        Box::pin(async move {
            let mut headers = Headers::new();
            headers.insert("content-type".into(), "text/event-stream".into());
            headers.insert("x-worker-instance".into(), this.instance_id.clone());
            stream.write_headers(headers)?;

            let method = request.headers.get(METHOD_PSEUDO_HEADER).map(String::as_str).unwrap_or("GET");
            let path = request.headers.get(PATH_PSEUDO_HEADER).map(String::as_str).unwrap_or("/");
            stream.write(format!("Hello from worker {}\n\n", this.instance_id))?;
            stream.write(format!("Incoming request: {} {} ({})\n\n", method, path, request.request_id))?;
            if !request.data.is_empty() {
                stream.write(format!("Body: {}\n\n", request.data))?;
            }

            for tick in 1..=this.ticks {
                tokio::time::sleep(this.interval).await;
                stream.write(format!("After {}ms\n\n", this.interval.as_millis() * tick as u128))?;
            }
            stream.end_with("ending stream\n\n")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerFrame;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_echo_handler_streams_request() {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let stream = OutputStream::new("r1".into(), Arc::from("w1"), frames_tx, done_tx);

        let mut headers = Headers::new();
        headers.insert(PATH_PSEUDO_HEADER.into(), "/hello".into());
        let request = IncomingRequest {
            request_id: "r1".into(),
            headers,
            data: String::new(),
        };

        EchoHandler::new(Duration::from_secs(1), 2)
            .handle(request, stream)
            .await
            .unwrap();

        let mut body = String::new();
        let mut closed = false;
        while let Ok(frame) = frames_rx.try_recv() {
            match frame {
                WorkerFrame::OutgoingData { data, .. } => body.push_str(&data),
                WorkerFrame::OutgoingClose { .. } => closed = true,
                _ => {}
            }
        }
        assert!(closed);
        assert!(body.contains("GET /hello (r1)"));
        assert!(body.contains("After 2000ms"));
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |_req: IncomingRequest, stream: OutputStream| async move { stream.end() };
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let stream = OutputStream::new("r1".into(), Arc::from("w1"), frames_tx, done_tx);
        let request = IncomingRequest {
            request_id: "r1".into(),
            headers: Headers::new(),
            data: String::new(),
        };

        handler.handle(request, stream).await.unwrap();
        assert!(matches!(frames_rx.try_recv().unwrap(), WorkerFrame::OutgoingHeaders { .. }));
    }
}
