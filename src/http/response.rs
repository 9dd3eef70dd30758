//! Worker response → client response.
//!
//! # Responsibilities
//! - Take the status from the `:status` pseudo header (default 200)
//! - Copy worker headers, dropping pseudo and hop-by-hop headers
//! - Stream the body as frames arrive
//! - Map dispatch errors to status codes

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::dispatcher::DispatchError;
use crate::protocol::{REQUEST_ID_HEADER, STATUS_PSEUDO_HEADER};
use crate::session::WorkerResponse;

/// Headers managed by the connection between edge and client.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Build the streaming client response from a worker's headers and body.
pub fn into_response(request_id: &str, worker: WorkerResponse) -> Response {
    let status = worker
        .headers
        .get(STATUS_PSEUDO_HEADER)
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);

    let mut response = Response::new(Body::from_stream(worker.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in worker.headers.iter() {
        if name.starts_with(':') {
            continue;
        }
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        match (HeaderName::from_bytes(lower.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(request_id = %request_id, header = %name, "Dropping invalid worker header"),
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    response
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
