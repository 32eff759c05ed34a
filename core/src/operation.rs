//! The closed set of logical operations a descriptor can carry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag routing a completed exchange to its classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CheckInstallation,
    StartSession,
    EndSession,
    ListDatabases,
    CreateDatabase,
    DeleteDatabase,
    ListDocuments,
    GetRevision,
    GetDocument,
    PutDocument,
    DeleteDocument,
    PutAttachment,
    DeleteAttachment,
    Replicate,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::CheckInstallation,
        Operation::StartSession,
        Operation::EndSession,
        Operation::ListDatabases,
        Operation::CreateDatabase,
        Operation::DeleteDatabase,
        Operation::ListDocuments,
        Operation::GetRevision,
        Operation::GetDocument,
        Operation::PutDocument,
        Operation::DeleteDocument,
        Operation::PutAttachment,
        Operation::DeleteAttachment,
        Operation::Replicate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::CheckInstallation => "check_installation",
            Operation::StartSession => "start_session",
            Operation::EndSession => "end_session",
            Operation::ListDatabases => "list_databases",
            Operation::CreateDatabase => "create_database",
            Operation::DeleteDatabase => "delete_database",
            Operation::ListDocuments => "list_documents",
            Operation::GetRevision => "get_revision",
            Operation::GetDocument => "get_document",
            Operation::PutDocument => "put_document",
            Operation::DeleteDocument => "delete_document",
            Operation::PutAttachment => "put_attachment",
            Operation::DeleteAttachment => "delete_attachment",
            Operation::Replicate => "replicate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Replication may legitimately run for a very long time (or forever
    /// when continuous), so it is never put under a deadline.
    pub fn is_replication(self) -> bool {
        matches!(self, Operation::Replicate)
    }

    /// Mutations whose success is signalled by `{"ok": true}` in the body.
    pub fn requires_ok_flag(self) -> bool {
        matches!(
            self,
            Operation::CreateDatabase
                | Operation::DeleteDatabase
                | Operation::PutDocument
                | Operation::DeleteDocument
                | Operation::PutAttachment
                | Operation::DeleteAttachment
                | Operation::Replicate
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
