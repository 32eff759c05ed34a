//! The caller-visible result of one logical operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Terminal result of one operation, produced exactly once and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub operation: Operation,
    pub status: OutcomeStatus,
    /// Raw response body; empty after a transport failure.
    pub data: Vec<u8>,
    /// Decoded body, `None` when it was not JSON or was empty.
    pub document: Option<Value>,
    /// Revision projected from the body, or from `ETag` for `get_revision`.
    pub revision: Option<String>,
    /// HTTP status, `None` after a transport failure.
    pub http_status: Option<u16>,
    /// Response headers (lowercase names), e.g. `set-cookie` after a session
    /// start.
    pub headers: Vec<(String, String)>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Field of the decoded body, if it is an object containing `key`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.document.as_ref().and_then(|d| d.get(key))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Deserialize the decoded body into a caller type.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}
