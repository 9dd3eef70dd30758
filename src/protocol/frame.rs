//! Frame definitions and JSON encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header map carried inside frames.
pub type Headers = BTreeMap<String, String>;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A binary message arrived where only text frames are allowed.
    #[error("unexpected binary message ({0} bytes)")]
    Binary(usize),
}

/// Request payload forwarded to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    pub request_id: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub data: String,
}

/// Bootstrap payload used to cold-start a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialRequest {
    pub request_id: String,
    pub server_id: String,
    pub host: String,
}

/// Frames flowing from the edge to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EdgeFrame {
    Incoming(IncomingRequest),
    Initial(InitialRequest),
}

/// Frames flowing from a worker to the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerFrame {
    #[serde(rename_all = "camelCase")]
    Ready { server_id: String },

    #[serde(rename_all = "camelCase")]
    OutgoingHeaders {
        request_id: String,
        server_id: String,
        headers: Headers,
    },

    #[serde(rename_all = "camelCase")]
    OutgoingData {
        request_id: String,
        server_id: String,
        data: String,
    },

    #[serde(rename_all = "camelCase")]
    OutgoingClose {
        request_id: String,
        server_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Closing { server_id: String },
}

impl EdgeFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl WorkerFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Request id the frame belongs to, if it is request scoped.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerFrame::OutgoingHeaders { request_id, .. }
            | WorkerFrame::OutgoingData { request_id, .. }
            | WorkerFrame::OutgoingClose { request_id, .. } => Some(request_id),
            WorkerFrame::Ready { .. } | WorkerFrame::Closing { .. } => None,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            WorkerFrame::Ready { server_id }
            | WorkerFrame::OutgoingHeaders { server_id, .. }
            | WorkerFrame::OutgoingData { server_id, .. }
            | WorkerFrame::OutgoingClose { server_id, .. }
            | WorkerFrame::Closing { server_id } => server_id,
        }
    }

    /// Wire tag, used as a log field and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerFrame::Ready { .. } => "ready",
            WorkerFrame::OutgoingHeaders { .. } => "outgoing-headers",
            WorkerFrame::OutgoingData { .. } => "outgoing-data",
            WorkerFrame::OutgoingClose { .. } => "outgoing-close",
            WorkerFrame::Closing { .. } => "closing",
        }
    }
}
