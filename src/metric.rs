use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::oneshot;

/// A single metric observation as delivered by the line protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Dotted metric path, e.g. "sys.host1.cpu.user".
    pub path: String,
    /// Observed value.
    pub value: f64,
    /// Seconds since epoch as reported by the sender.
    pub timestamp: f64,
}

/// Outcome carried back to the API for a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Error,
}

/// Response envelope for requests multiplexed over the internal channels.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: Status,
    pub message: String,
    pub payload: Vec<u8>,
}

impl ApiResponse {
    /// An OK envelope carrying a serialized payload.
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            message: String::new(),
            payload,
        }
    }

    /// A BADREQUEST envelope with a human-readable reason.
    pub fn bad_request(message: &str) -> Self {
        Self {
            status: Status::BadRequest,
            message: message.to_string(),
            payload: Vec::new(),
        }
    }
}

/// Range-read request dispatched to the store manager.
#[derive(Debug)]
pub struct MetricRequest {
    /// Inclusive range start, seconds since epoch.
    pub from: i64,
    /// Inclusive range end, seconds since epoch.
    pub to: i64,
    /// Request method ("get" or "delete").
    pub method: String,
    /// Paths to read.
    pub query: Vec<String>,
    /// One-shot response sink. The receiver may be dropped before
    /// delivery if the caller gave up on the request.
    pub reply: oneshot::Sender<ApiResponse>,
}

/// Path-discovery request dispatched to the resolver.
#[derive(Debug)]
pub struct PathRequest {
    /// Wildcard pattern, e.g. "sys.*.cpu.*".
    pub query: String,
    /// Serialized JSON result; an empty list on any failure.
    pub reply: oneshot::Sender<Vec<u8>>,
}

/// JSON body of a range-read response.
#[derive(Debug, Serialize)]
pub struct MetricResponse {
    pub from: i64,
    pub to: i64,
    pub step: i64,
    pub series: BTreeMap<String, Vec<f64>>,
}

/// Returns whether `path` is a well-formed metric path: non-empty ASCII
/// identifiers joined by single dots, with none of the characters the
/// index encoding reserves.
pub fn valid_path(path: &str) -> bool {
    if path.is_empty() || !path.is_ascii() {
        return false;
    }

    path.split('.').all(|node| {
        !node.is_empty()
            && node
                .bytes()
                .all(|b| b != b'*' && b != b':' && !b.is_ascii_whitespace())
    })
}
