//! Turns a completed exchange into an `Outcome`.
//!
//! # Design
//! Classification never fails. A transport failure is an error outcome with
//! an empty payload; otherwise the body is decoded best-effort and each
//! operation applies its own success rule:
//!
//! - `check_installation` needs the `couchdb` marker key.
//! - Mutations (database, document, attachment, replicate) need `"ok": true`;
//!   a 2xx without it is still an error.
//! - `get_revision` reads the `ETag` header instead of the body.
//! - Listings, document reads and session calls succeed on any completed
//!   2xx exchange and pass the body through.
//!
//! The asymmetry is deliberate per operation and must not be generalized.

use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;
use crate::http::HttpResponse;
use crate::operation::Operation;
use crate::outcome::{Outcome, OutcomeStatus};

/// Key present in the server welcome object.
pub const INSTALLATION_MARKER: &str = "couchdb";

const REVISION_FIELDS: [&str; 3] = ["rev", "_rev", "revision"];

/// Classify the result of one exchange for `operation`.
pub fn classify(operation: Operation, result: Result<HttpResponse, TransportError>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            debug!(%operation, error = %err, "classifying transport failure");
            return Outcome {
                operation,
                status: OutcomeStatus::Error,
                data: Vec::new(),
                document: None,
                revision: None,
                http_status: None,
                headers: Vec::new(),
            };
        }
    };

    let document = decode(&response.body);
    let mut revision = document.as_ref().and_then(project_revision);

    let success = match operation {
        Operation::CheckInstallation => document
            .as_ref()
            .is_some_and(|d| d.get(INSTALLATION_MARKER).is_some()),
        Operation::GetRevision => match etag_revision(&response) {
            Some(rev) => {
                revision = Some(rev);
                true
            }
            None => false,
        },
        op if op.requires_ok_flag() => document
            .as_ref()
            .and_then(|d| d.get("ok"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        _ => response.is_success(),
    };

    Outcome {
        operation,
        status: if success {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Error
        },
        data: response.body,
        document,
        revision,
        http_status: Some(response.status),
        headers: response.headers,
    }
}

/// Decode a body as JSON. Unparsable, null and empty documents are absent.
fn decode(body: &[u8]) -> Option<Value> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match &value {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        _ => Some(value),
    }
}

fn project_revision(document: &Value) -> Option<String> {
    REVISION_FIELDS
        .iter()
        .find_map(|key| document.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Entity tag with every quote character removed; `None` when empty.
pub fn etag_revision(response: &HttpResponse) -> Option<String> {
    let tag: String = response.header("etag")?.chars().filter(|c| *c != '"').collect();
    let tag = tag.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(200, body.as_bytes().to_vec()))
    }

    #[test]
    fn mutation_with_ok_true_succeeds() {
        for op in Operation::ALL.into_iter().filter(|op| op.requires_ok_flag()) {
            let outcome = classify(op, ok(r#"{"ok":true}"#));
            assert!(outcome.is_success(), "{op}");
        }
    }

    #[test]
    fn mutation_with_ok_false_fails_despite_2xx() {
        let outcome = classify(Operation::CreateDatabase, ok(r#"{"ok":false}"#));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.http_status, Some(200));
    }

    #[test]
    fn mutation_without_ok_field_fails() {
        let outcome = classify(Operation::PutDocument, ok(r#"{"id":"a","rev":"1-x"}"#));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.revision.as_deref(), Some("1-x"));
    }

    #[test]
    fn transport_failure_is_error_with_empty_payload() {
        let outcome = classify(Operation::DeleteDocument, Err(TransportError::new("connection refused")));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.data.is_empty());
        assert!(outcome.document.is_none());
        assert!(outcome.http_status.is_none());
    }

    #[test]
    fn check_installation_needs_marker() {
        let welcome = classify(Operation::CheckInstallation, ok(r#"{"couchdb":"Welcome","version":"3.3.3"}"#));
        assert!(welcome.is_success());

        let other = classify(Operation::CheckInstallation, ok(r#"{"hello":"world"}"#));
        assert_eq!(other.status, OutcomeStatus::Error);

        let html = classify(Operation::CheckInstallation, ok("<html></html>"));
        assert_eq!(html.status, OutcomeStatus::Error);
    }

    #[test]
    fn get_revision_strips_quotes_from_etag() {
        let response = HttpResponse::new(200, Vec::new()).with_header("ETag", "\"abc123\"");
        let outcome = classify(Operation::GetRevision, Ok(response));
        assert!(outcome.is_success());
        assert_eq!(outcome.revision.as_deref(), Some("abc123"));
    }

    #[test]
    fn get_revision_without_etag_fails() {
        let outcome = classify(Operation::GetRevision, Ok(HttpResponse::new(404, Vec::new())));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.revision.is_none());

        let empty = HttpResponse::new(200, Vec::new()).with_header("etag", "\"\"");
        assert_eq!(classify(Operation::GetRevision, Ok(empty)).status, OutcomeStatus::Error);
    }

    #[test]
    fn reads_pass_body_through() {
        let outcome = classify(Operation::GetDocument, ok(r#"{"_id":"item1","_rev":"1-x","name":"widget"}"#));
        assert!(outcome.is_success());
        assert_eq!(outcome.field("name"), Some(&Value::from("widget")));
        assert_eq!(outcome.revision.as_deref(), Some("1-x"));
    }

    #[test]
    fn read_with_http_error_status_fails() {
        let response = HttpResponse::new(404, br#"{"error":"not_found","reason":"missing"}"#.to_vec());
        let outcome = classify(Operation::GetDocument, Ok(response));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.field("error"), Some(&Value::from("not_found")));
    }

    #[test]
    fn unparsable_body_yields_absent_document() {
        let outcome = classify(Operation::ListDatabases, ok("not json"));
        assert!(outcome.is_success());
        assert!(outcome.document.is_none());
        assert_eq!(outcome.data, b"not json");
    }

    #[test]
    fn empty_list_is_absent_document_but_success() {
        let outcome = classify(Operation::ListDatabases, ok("[]"));
        assert!(outcome.is_success());
        assert!(outcome.document.is_none());
    }

    #[test]
    fn session_headers_are_kept() {
        let response = HttpResponse::new(200, br#"{"ok":true,"name":"bob"}"#.to_vec())
            .with_header("Set-Cookie", "AuthSession=abc; Path=/");
        let outcome = classify(Operation::StartSession, Ok(response));
        assert!(outcome.is_success());
        assert_eq!(outcome.header("set-cookie"), Some("AuthSession=abc; Path=/"));
    }
}
