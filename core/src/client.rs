//! Stateless descriptor builder for the CouchDB HTTP API.
//!
//! # Design
//! `CouchClient` holds only a `ServerIdentity` and carries no mutable state
//! between calls. Each operation has a `build_*` method producing a
//! `Descriptor`; executing it and classifying the result is left to the
//! caller (the async `CouchDb` reactor, or a foreign host through the FFI
//! crate). Database, document and attachment names are percent-encoded as
//! single path segments.

use std::borrow::Cow;

use crate::descriptor::Descriptor;
use crate::error::ApiError;
use crate::http::HttpMethod;
use crate::operation::Operation;
use crate::server::ServerIdentity;
use crate::types::ReplicationRequest;

const JSON: &str = "application/json";
const FORM: &str = "application/x-www-form-urlencoded";

/// Options shared by both replication directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationOptions {
    pub create_target: bool,
    pub continuous: bool,
    pub cancel: bool,
}

/// Builds `Descriptor` values for one server without touching the network.
#[derive(Debug, Clone, Default)]
pub struct CouchClient {
    server: ServerIdentity,
}

impl CouchClient {
    pub fn new(server: ServerIdentity) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut ServerIdentity {
        &mut self.server
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.base_url(), path)
    }

    /// Start a descriptor, attaching the Basic credential when configured.
    fn descriptor(&self, operation: Operation, method: HttpMethod, path: &str) -> Descriptor {
        let descriptor = Descriptor::new(operation, method, self.url(path));
        match self.server.credential_token() {
            Some(token) => descriptor.with_header("Authorization", format!("Basic {token}")),
            None => descriptor,
        }
    }

    pub fn build_check_installation(&self) -> Descriptor {
        self.descriptor(Operation::CheckInstallation, HttpMethod::Get, "/")
    }

    pub fn build_start_session(&self, username: &str, password: &str) -> Descriptor {
        let body = format!(
            "name={}&password={}",
            urlencoding::encode(username),
            urlencoding::encode(password)
        );
        self.descriptor(Operation::StartSession, HttpMethod::Post, "/_session")
            .with_header("Accept", JSON)
            .with_header("Content-Type", FORM)
            .with_body(body.into_bytes())
    }

    pub fn build_end_session(&self) -> Descriptor {
        self.descriptor(Operation::EndSession, HttpMethod::Delete, "/_session")
    }

    pub fn build_list_databases(&self) -> Descriptor {
        self.descriptor(Operation::ListDatabases, HttpMethod::Get, "/_all_dbs")
    }

    pub fn build_create_database(&self, database: &str) -> Descriptor {
        let path = format!("/{}", segment(database));
        self.descriptor(Operation::CreateDatabase, HttpMethod::Put, &path)
            .with_body(Vec::new())
    }

    pub fn build_delete_database(&self, database: &str) -> Descriptor {
        let path = format!("/{}", segment(database));
        self.descriptor(Operation::DeleteDatabase, HttpMethod::Delete, &path)
    }

    pub fn build_list_documents(&self, database: &str) -> Descriptor {
        let path = format!("/{}/_all_docs", segment(database));
        self.descriptor(Operation::ListDocuments, HttpMethod::Get, &path)
    }

    /// HEAD request; the revision comes back in the `ETag` header.
    pub fn build_get_revision(&self, database: &str, document_id: &str) -> Descriptor {
        let path = format!("/{}/{}", segment(database), segment(document_id));
        self.descriptor(Operation::GetRevision, HttpMethod::Head, &path)
    }

    pub fn build_get_document(&self, database: &str, document_id: &str) -> Descriptor {
        let path = format!("/{}/{}", segment(database), segment(document_id));
        self.descriptor(Operation::GetDocument, HttpMethod::Get, &path)
    }

    /// PUT a full JSON document. Updates must carry `_rev` inside `document`.
    pub fn build_put_document(&self, database: &str, document_id: &str, document: Vec<u8>) -> Descriptor {
        let path = format!("/{}/{}", segment(database), segment(document_id));
        self.descriptor(Operation::PutDocument, HttpMethod::Put, &path)
            .with_header("Accept", JSON)
            .with_header("Content-Type", JSON)
            .with_body(document)
    }

    /// Serialize `document` and PUT it.
    pub fn build_put_json<T: serde::Serialize>(
        &self,
        database: &str,
        document_id: &str,
        document: &T,
    ) -> Result<Descriptor, ApiError> {
        let body = serde_json::to_vec(document)?;
        Ok(self.build_put_document(database, document_id, body))
    }

    pub fn build_delete_document(&self, database: &str, document_id: &str, revision: &str) -> Descriptor {
        let path = format!(
            "/{}/{}?rev={}",
            segment(database),
            segment(document_id),
            segment(revision)
        );
        self.descriptor(Operation::DeleteDocument, HttpMethod::Delete, &path)
    }

    pub fn build_put_attachment(
        &self,
        database: &str,
        document_id: &str,
        attachment_name: &str,
        attachment: Vec<u8>,
        mime_type: &str,
        revision: &str,
    ) -> Descriptor {
        let path = format!(
            "/{}/{}/{}?rev={}",
            segment(database),
            segment(document_id),
            segment(attachment_name),
            segment(revision)
        );
        self.descriptor(Operation::PutAttachment, HttpMethod::Put, &path)
            .with_header("Content-Type", mime_type)
            .with_body(attachment)
    }

    pub fn build_delete_attachment(
        &self,
        database: &str,
        document_id: &str,
        attachment_name: &str,
        revision: &str,
    ) -> Descriptor {
        let path = format!(
            "/{}/{}/{}?rev={}",
            segment(database),
            segment(document_id),
            segment(attachment_name),
            segment(revision)
        );
        self.descriptor(Operation::DeleteAttachment, HttpMethod::Delete, &path)
    }

    pub fn build_replicate(&self, request: &ReplicationRequest) -> Result<Descriptor, ApiError> {
        let body = serde_json::to_vec(request)?;
        Ok(self
            .descriptor(Operation::Replicate, HttpMethod::Post, "/_replicate")
            .with_header("Accept", JSON)
            .with_header("Content-Type", JSON)
            .with_body(body))
    }

    /// Pull `source_database` from `source` into the local `target_database`.
    pub fn build_replicate_from(
        &self,
        source: &ServerIdentity,
        source_database: &str,
        target_database: &str,
        options: ReplicationOptions,
    ) -> Result<Descriptor, ApiError> {
        self.build_replicate(&ReplicationRequest {
            source: remote_database_url(source, source_database),
            target: target_database.to_string(),
            create_target: options.create_target,
            continuous: options.continuous,
            cancel: options.cancel,
        })
    }

    /// Push the local `source_database` to `target_database` on `target`.
    pub fn build_replicate_to(
        &self,
        target: &ServerIdentity,
        source_database: &str,
        target_database: &str,
        options: ReplicationOptions,
    ) -> Result<Descriptor, ApiError> {
        self.build_replicate(&ReplicationRequest {
            source: source_database.to_string(),
            target: remote_database_url(target, target_database),
            create_target: options.create_target,
            continuous: options.continuous,
            cancel: options.cancel,
        })
    }
}

fn remote_database_url(server: &ServerIdentity, database: &str) -> String {
    format!("{}/{}", server.base_url_with_credential(), segment(database))
}

/// Percent-encode one path segment or query value.
pub(crate) fn segment(raw: &str) -> Cow<'_, str> {
    urlencoding::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CouchClient {
        CouchClient::new(ServerIdentity::new("localhost", 5984))
    }

    #[test]
    fn check_installation_targets_root() {
        let d = client().build_check_installation();
        assert_eq!(d.operation(), Operation::CheckInstallation);
        assert_eq!(d.method(), HttpMethod::Get);
        assert_eq!(d.url(), "http://localhost:5984/");
        assert!(d.headers().is_empty());
        assert!(d.body().is_none());
    }

    #[test]
    fn create_database_is_put_with_empty_body() {
        let d = client().build_create_database("shop");
        assert_eq!(d.method(), HttpMethod::Put);
        assert_eq!(d.url(), "http://localhost:5984/shop");
        assert_eq!(d.body(), Some(&b""[..]));
    }

    #[test]
    fn start_session_posts_form_encoded_credentials() {
        let d = client().build_start_session("bob", "a&b c");
        assert_eq!(d.method(), HttpMethod::Post);
        assert_eq!(d.url(), "http://localhost:5984/_session");
        assert_eq!(d.header("content-type"), Some("application/x-www-form-urlencoded"));
        assert_eq!(d.body(), Some(&b"name=bob&password=a%26b%20c"[..]));
    }

    #[test]
    fn credential_adds_basic_authorization() {
        let c = CouchClient::new(ServerIdentity::default().with_credential("admin", "secret"));
        let d = c.build_list_databases();
        assert_eq!(d.header("Authorization"), Some("Basic YWRtaW46c2VjcmV0"));
    }

    #[test]
    fn get_revision_uses_head() {
        let d = client().build_get_revision("shop", "item1");
        assert_eq!(d.method(), HttpMethod::Head);
        assert_eq!(d.url(), "http://localhost:5984/shop/item1");
    }

    #[test]
    fn document_ids_are_encoded_as_one_segment() {
        let d = client().build_get_document("shop", "_design/app");
        assert_eq!(d.url(), "http://localhost:5984/shop/_design%2Fapp");
    }

    #[test]
    fn put_document_sends_json_headers() {
        let d = client().build_put_document("shop", "item1", br#"{"name":"widget"}"#.to_vec());
        assert_eq!(d.method(), HttpMethod::Put);
        assert_eq!(d.header("Content-Type"), Some("application/json"));
        assert_eq!(d.header("Accept"), Some("application/json"));
        assert_eq!(d.body(), Some(&br#"{"name":"widget"}"#[..]));
    }

    #[test]
    fn put_json_serializes_value() {
        let doc = serde_json::json!({"_rev": "1-x", "name": "gadget"});
        let d = client().build_put_json("shop", "item1", &doc).unwrap();
        let body: serde_json::Value = serde_json::from_slice(d.body().unwrap()).unwrap();
        assert_eq!(body, doc);
    }

    #[test]
    fn delete_document_carries_revision() {
        let d = client().build_delete_document("shop", "item1", "2-b");
        assert_eq!(d.method(), HttpMethod::Delete);
        assert_eq!(d.url(), "http://localhost:5984/shop/item1?rev=2-b");
        assert!(d.body().is_none());
    }

    #[test]
    fn put_attachment_uses_mime_type() {
        let d = client().build_put_attachment("shop", "item1", "photo.png", vec![1, 2, 3], "image/png", "1-x");
        assert_eq!(d.url(), "http://localhost:5984/shop/item1/photo.png?rev=1-x");
        assert_eq!(d.header("Content-Type"), Some("image/png"));
        assert_eq!(d.body(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn delete_attachment_targets_attachment_path() {
        let d = client().build_delete_attachment("shop", "item1", "photo.png", "2-y");
        assert_eq!(d.operation(), Operation::DeleteAttachment);
        assert_eq!(d.url(), "http://localhost:5984/shop/item1/photo.png?rev=2-y");
    }

    #[test]
    fn replicate_from_embeds_remote_credential_in_source() {
        let remote = ServerIdentity::new("remote", 5984).with_credential("bob", "pw");
        let options = ReplicationOptions {
            create_target: true,
            continuous: true,
            cancel: false,
        };
        let d = client().build_replicate_from(&remote, "shop", "shop-copy", options).unwrap();
        assert_eq!(d.method(), HttpMethod::Post);
        assert_eq!(d.url(), "http://localhost:5984/_replicate");
        let body: serde_json::Value = serde_json::from_slice(d.body().unwrap()).unwrap();
        assert_eq!(body["source"], "http://bob:pw@remote:5984/shop");
        assert_eq!(body["target"], "shop-copy");
        assert_eq!(body["create_target"], true);
        assert_eq!(body["continuous"], true);
        assert_eq!(body["cancel"], false);
    }

    #[test]
    fn replicate_to_puts_remote_in_target() {
        let remote = ServerIdentity::new("remote", 6984).with_secure(true);
        let d = client()
            .build_replicate_to(&remote, "shop", "backup", ReplicationOptions::default())
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(d.body().unwrap()).unwrap();
        assert_eq!(body["source"], "shop");
        assert_eq!(body["target"], "https://remote:6984/backup");
    }
}
