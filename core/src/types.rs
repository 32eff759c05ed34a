//! Wire DTOs exchanged with the server.
//!
//! # Design
//! Only the shapes the client itself produces or inspects get a type here.
//! Document bodies and listing payloads stay `serde_json::Value` and are
//! projected by the caller.

use serde::{Deserialize, Serialize};

/// Body of `POST /_replicate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub create_target: bool,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub cancel: bool,
}

/// One `changes` entry of a change-feed row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeRevision {
    pub rev: String,
}

/// One row of a continuous change feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub seq: Option<serde_json::Value>,
    pub changes: Vec<ChangeRevision>,
    #[serde(default)]
    pub deleted: bool,
}

/// Error object the server writes in place of a row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerError {
    pub error: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_request_serializes_all_flags() {
        let req = ReplicationRequest {
            source: "http://remote:5984/shop".to_string(),
            target: "shop".to_string(),
            create_target: true,
            continuous: false,
            cancel: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["source"], "http://remote:5984/shop");
        assert_eq!(json["create_target"], true);
        assert_eq!(json["continuous"], false);
        assert_eq!(json["cancel"], false);
    }

    #[test]
    fn change_row_tolerates_missing_id() {
        let row: ChangeRow = serde_json::from_str(r#"{"seq":3,"changes":[{"rev":"2-b"}]}"#).unwrap();
        assert_eq!(row.id, None);
        assert_eq!(row.changes[0].rev, "2-b");
        assert!(!row.deleted);
    }

    #[test]
    fn change_row_requires_changes() {
        let row: Result<ChangeRow, _> = serde_json::from_str(r#"{"last_seq":12}"#);
        assert!(row.is_err());
    }
}
