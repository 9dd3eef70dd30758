//! Shared utilities for end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use duplex_router::config::{RouterConfig, WorkerConfig};
use duplex_router::lifecycle::Shutdown;
use duplex_router::protocol::{Headers, IncomingRequest, InitialRequest};
use duplex_router::registry::{MemoryStore, Registry};
use duplex_router::session::{HttpInvoker, InvokeFuture, WorkerInvoker};
use duplex_router::worker::{OutputStream, RequestHandler, StreamError, WorkerServer};
use duplex_router::HttpServer;
use tokio::net::TcpListener;

/// A running router and the handles tests inspect it through.
pub struct TestRouter {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    pub invocations: Arc<AtomicUsize>,
    pub shutdown: Shutdown,
}

impl TestRouter {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// Counts invocations before handing them to the real HTTP invoker.
#[derive(Debug)]
pub struct CountingInvoker {
    inner: HttpInvoker,
    count: Arc<AtomicUsize>,
}

impl WorkerInvoker for CountingInvoker {
    fn invoke(&self, initial: InitialRequest) -> InvokeFuture {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(initial)
    }
}

/// Start a worker process (invocation endpoint) on an ephemeral port.
pub async fn start_worker<H: RequestHandler>(config: WorkerConfig, handler: H) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = WorkerServer::new(config, Arc::new(handler));
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _keep = shutdown;
        let _ = server.run(listener, rx).await;
    });
    addr
}

/// Start a router whose cold starts go to `worker_addr`.
pub async fn start_router(mut config: RouterConfig, worker_addr: SocketAddr) -> TestRouter {
    config.bootstrap.invoke_url = format!("http://{}/invoke", worker_addr);

    let registry = Arc::new(Registry::load(Arc::new(MemoryStore::new()), &config.pool).unwrap());
    let invocations = Arc::new(AtomicUsize::new(0));
    let invoker = Arc::new(CountingInvoker {
        inner: HttpInvoker::new(&config.bootstrap),
        count: invocations.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config, registry.clone(), invoker);
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestRouter {
        addr,
        registry,
        invocations,
        shutdown,
    }
}

/// HTTP client without connection pooling or proxies.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Handler answering `text/plain` with `body`.
pub fn text_handler(body: &'static str) -> impl RequestHandler {
    move |_req: IncomingRequest, mut stream: OutputStream| async move {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "text/plain".into());
        stream.write_headers(headers)?;
        stream.end_with(body)
    }
}

/// Handler that holds each response open for `delay` before answering.
pub fn slow_handler(delay: std::time::Duration) -> impl RequestHandler {
    move |req: IncomingRequest, mut stream: OutputStream| async move {
        stream.write_headers(Headers::new())?;
        tokio::time::sleep(delay).await;
        stream.write(format!("done {}", req.request_id))?;
        Ok::<(), StreamError>(())
    }
}
