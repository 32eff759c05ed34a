//! Endpoint descriptors: one immutable value per logical call.
//!
//! # Design
//! A `Descriptor` carries everything needed to (re)issue an exchange:
//! method, URL, headers, body and the operation tag used to classify the
//! result. Each one gets a random instance id at construction, which the
//! request tracker uses to refuse a second in-flight submission of the same
//! instance. Once submitted it lives behind an `Arc`, so a timeout retry
//! reissues byte-identical request data.

use uuid::Uuid;

use crate::http::HttpMethod;
use crate::operation::Operation;

/// Immutable description of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    id: Uuid,
    operation: Operation,
    method: HttpMethod,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl Descriptor {
    pub fn new(operation: Operation, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Look up a request header by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// True when both descriptors would put the same bytes on the wire.
    pub fn same_request(&self, other: &Descriptor) -> bool {
        self.method == other.method
            && self.url == other.url
            && self.headers == other.headers
            && self.body == other.body
    }
}
