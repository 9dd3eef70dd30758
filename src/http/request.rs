//! Client request → `incoming` frame.
//!
//! # Responsibilities
//! - Resolve the request id (set by the request-id layer, or freshly generated)
//! - Carry method and path as pseudo headers next to the client headers
//! - Read the bounded body into the frame's `data`

use axum::body::Body;
use axum::http::{header, HeaderMap, Request};
use futures_util::StreamExt;
use thiserror::Error;

use crate::protocol::{Headers, IncomingRequest, METHOD_PSEUDO_HEADER, PATH_PSEUDO_HEADER, REQUEST_ID_HEADER};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,

    #[error("failed to read request body: {0}")]
    Body(String),
}

/// Request id of `headers`, or a new one if the client sent none.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Host the client addressed, used as the worker's dial-back target.
pub fn host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Convert a client request into the frame sent to a worker.
pub async fn into_incoming(
    request: Request<Body>,
    request_id: String,
    max_body_size: usize,
) -> Result<IncomingRequest, RequestError> {
    let (parts, body) = request.into_parts();

    let mut headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers.insert(METHOD_PSEUDO_HEADER.to_string(), parts.method.to_string());
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    headers.insert(PATH_PSEUDO_HEADER.to_string(), path);

    let mut bytes = Vec::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RequestError::Body(e.to_string()))?;
        if bytes.len() + chunk.len() > max_body_size {
            return Err(RequestError::BodyTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(IncomingRequest {
        request_id,
        headers,
        data: String::from_utf8_lossy(&bytes).into_owned(),
    })
}
