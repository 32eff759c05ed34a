//! In-memory stand-in for a CouchDB server.
//!
//! Covers the subset of the HTTP API the client talks to: welcome object,
//! cookie sessions, database and document CRUD with revision checks,
//! attachments, one-shot local replication and the `_changes` feed (normal
//! and continuous). Remote replication endpoints are treated as databases of
//! this same server, addressed by the last path segment of their URL.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{
    net::TcpListener,
    sync::{broadcast, RwLock},
};
use tracing::{debug, info};
use uuid::Uuid;

const FEED_CAPACITY: usize = 256;
const FILTERED_NAME_PARAM: &str = "name";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub rev: String,
}

/// One row of the `_changes` feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub seq: u64,
    pub id: String,
    pub changes: Vec<RevisionRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Clone, Debug)]
struct Attachment {
    content_type: String,
    data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
struct Document {
    rev: String,
    fields: Map<String, Value>,
    attachments: BTreeMap<String, Attachment>,
    deleted: bool,
}

impl Document {
    fn render(&self, id: &str) -> Value {
        let mut out = Map::new();
        out.insert("_id".into(), Value::from(id));
        out.insert("_rev".into(), Value::from(self.rev.as_str()));
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        if !self.attachments.is_empty() {
            let stubs: Map<String, Value> = self
                .attachments
                .iter()
                .map(|(name, att)| {
                    let stub = json!({
                        "content_type": att.content_type,
                        "length": att.data.len(),
                        "stub": true,
                    });
                    (name.clone(), stub)
                })
                .collect();
            out.insert("_attachments".into(), Value::Object(stubs));
        }
        Value::Object(out)
    }
}

#[derive(Debug)]
pub struct Database {
    documents: BTreeMap<String, Document>,
    /// Latest change per document, in sequence order.
    changes: Vec<Change>,
    seq: u64,
    feed: broadcast::Sender<Change>,
}

impl Default for Database {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            documents: BTreeMap::new(),
            changes: Vec::new(),
            seq: 0,
            feed,
        }
    }
}

impl Database {
    fn live(&self, id: &str) -> Option<&Document> {
        self.documents.get(id).filter(|d| !d.deleted)
    }

    /// Check `provided` against the current revision of `id`.
    fn check_revision(&self, id: &str, provided: Option<&str>) -> Result<(), ApiError> {
        let current = self.live(id).map(|d| d.rev.as_str());
        if current == provided {
            Ok(())
        } else {
            Err(ApiError::Conflict)
        }
    }

    fn record(&mut self, id: &str, rev: &str, deleted: bool) {
        self.seq += 1;
        let change = Change {
            seq: self.seq,
            id: id.to_string(),
            changes: vec![RevisionRef { rev: rev.to_string() }],
            deleted,
        };
        self.changes.retain(|c| c.id != id);
        self.changes.push(change.clone());
        // No subscribers is fine.
        let _ = self.feed.send(change);
    }

    /// Store a new revision of `id` and return it.
    fn commit(&mut self, id: &str, mut doc: Document) -> String {
        let previous = self.documents.get(id).map(|d| d.rev.as_str());
        doc.rev = next_revision(previous);
        let rev = doc.rev.clone();
        let deleted = doc.deleted;
        self.documents.insert(id.to_string(), doc);
        self.record(id, &rev, deleted);
        rev
    }
}

#[derive(Debug, Default)]
pub struct Store {
    databases: BTreeMap<String, Database>,
}

impl Store {
    fn database(&self, name: &str) -> Result<&Database, ApiError> {
        self.databases.get(name).ok_or(ApiError::NoDatabase)
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut Database, ApiError> {
        self.databases.get_mut(name).ok_or(ApiError::NoDatabase)
    }
}

pub type SharedStore = Arc<RwLock<Store>>;

/// `{generation}-{random}`, one generation past `previous`.
pub fn next_revision(previous: Option<&str>) -> String {
    let generation = previous
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

/// Server-side failure rendered as a CouchDB error object.
#[derive(Debug)]
pub enum ApiError {
    NoDatabase,
    Missing,
    Deleted,
    Conflict,
    FileExists,
    BadRequest(String),
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, reason) = match self {
            ApiError::NoDatabase => (StatusCode::NOT_FOUND, "not_found", "Database does not exist.".to_string()),
            ApiError::Missing => (StatusCode::NOT_FOUND, "not_found", "missing".to_string()),
            ApiError::Deleted => (StatusCode::NOT_FOUND, "not_found", "deleted".to_string()),
            ApiError::Conflict => (StatusCode::CONFLICT, "conflict", "Document update conflict.".to_string()),
            ApiError::FileExists => (
                StatusCode::PRECONDITION_FAILED,
                "file_exists",
                "The database could not be created, the file already exists.".to_string(),
            ),
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, "bad_request", reason),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Name or password is incorrect.".to_string(),
            ),
        };
        (status, Json(json!({ "error": error, "reason": reason }))).into_response()
    }
}

pub fn app() -> Router {
    app_with_store(Arc::new(RwLock::new(Store::default())))
}

pub fn app_with_store(store: SharedStore) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/_session", post(start_session).delete(end_session))
        .route("/_all_dbs", get(all_dbs))
        .route("/_replicate", post(replicate))
        .route("/{db}", get(database_info).put(create_database).delete(delete_database))
        .route("/{db}/_all_docs", get(all_docs))
        .route("/{db}/_changes", get(changes))
        .route("/{db}/{doc}", get(get_document).put(put_document).delete(delete_document))
        .route(
            "/{db}/{doc}/{att}",
            get(get_attachment).put(put_attachment).delete(delete_attachment),
        )
        .with_state(store)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn ok_revision(status: StatusCode, id: &str, rev: &str) -> Response {
    (
        status,
        [(header::ETAG, format!("\"{rev}\""))],
        Json(json!({ "ok": true, "id": id, "rev": rev })),
    )
        .into_response()
}

async fn welcome() -> Json<Value> {
    Json(json!({
        "couchdb": "Welcome",
        "version": "3.3.3",
        "vendor": { "name": "mock-server" },
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

async fn start_session(Form(form): Form<SessionForm>) -> Result<Response, ApiError> {
    if form.name.is_empty() || form.password.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    let cookie = format!("AuthSession={}; Version=1; Path=/; HttpOnly", Uuid::new_v4().simple());
    info!(name = %form.name, "session started");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "ok": true, "name": form.name, "roles": [] })),
    )
        .into_response())
}

async fn end_session() -> Response {
    (
        [(header::SET_COOKIE, "AuthSession=; Version=1; Path=/; HttpOnly".to_string())],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

async fn all_dbs(State(store): State<SharedStore>) -> Json<Vec<String>> {
    Json(store.read().await.databases.keys().cloned().collect())
}

async fn database_info(State(store): State<SharedStore>, Path(db): Path<String>) -> Result<Json<Value>, ApiError> {
    let store = store.read().await;
    let database = store.database(&db)?;
    let doc_count = database.documents.values().filter(|d| !d.deleted).count();
    Ok(Json(json!({
        "db_name": db,
        "doc_count": doc_count,
        "update_seq": database.seq,
    })))
}

async fn create_database(State(store): State<SharedStore>, Path(db): Path<String>) -> Result<Response, ApiError> {
    let mut store = store.write().await;
    if store.databases.contains_key(&db) {
        return Err(ApiError::FileExists);
    }
    store.databases.insert(db.clone(), Database::default());
    info!(%db, "database created");
    Ok((StatusCode::CREATED, Json(json!({ "ok": true }))).into_response())
}

async fn delete_database(State(store): State<SharedStore>, Path(db): Path<String>) -> Result<Json<Value>, ApiError> {
    let mut store = store.write().await;
    // Dropping the database closes its feed, ending continuous subscribers.
    store.databases.remove(&db).ok_or(ApiError::NoDatabase)?;
    info!(%db, "database deleted");
    Ok(Json(json!({ "ok": true })))
}

async fn all_docs(State(store): State<SharedStore>, Path(db): Path<String>) -> Result<Json<Value>, ApiError> {
    let store = store.read().await;
    let database = store.database(&db)?;
    let rows: Vec<Value> = database
        .documents
        .iter()
        .filter(|(_, d)| !d.deleted)
        .map(|(id, d)| json!({ "id": id, "key": id, "value": { "rev": d.rev } }))
        .collect();
    Ok(Json(json!({ "total_rows": rows.len(), "offset": 0, "rows": rows })))
}

/// Whether `change` passes the `filter`/`name` query of a feed request.
fn feed_selects(params: &HashMap<String, String>, change: &Change) -> bool {
    match (params.get("filter"), params.get(FILTERED_NAME_PARAM)) {
        (Some(_), Some(name)) => change.id == *name,
        _ => true,
    }
}

fn feed_line(change: &Change) -> Bytes {
    let mut line = serde_json::to_vec(change).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

async fn changes(
    State(store): State<SharedStore>,
    Path(db): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let store = store.read().await;
    let database = store.database(&db)?;

    let since = match params.get("since").map(String::as_str) {
        Some("now") => database.seq,
        Some(n) => n.parse().unwrap_or(0),
        None => 0,
    };
    let history: Vec<Change> = database
        .changes
        .iter()
        .filter(|c| c.seq > since && feed_selects(&params, c))
        .cloned()
        .collect();

    if params.get("feed").map(String::as_str) != Some("continuous") {
        return Ok(Json(json!({
            "results": history,
            "last_seq": database.seq,
            "pending": 0,
        }))
        .into_response());
    }

    // Subscribe while holding the lock so nothing falls between history and
    // live changes.
    let live = database.feed.subscribe();
    drop(store);
    debug!(%db, replay = history.len(), "continuous feed opened");

    let live = stream::unfold(live, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(change) => return Some((change, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    let body = stream::iter(history)
        .chain(live)
        .filter(move |c| futures::future::ready(feed_selects(&params, c)))
        .map(|c| Ok::<_, Infallible>(feed_line(&c)));

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn get_document(
    State(store): State<SharedStore>,
    Path((db, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let store = store.read().await;
    let database = store.database(&db)?;
    let doc = database.documents.get(&id).ok_or(ApiError::Missing)?;
    if doc.deleted {
        return Err(ApiError::Deleted);
    }
    Ok(([(header::ETAG, format!("\"{}\"", doc.rev))], Json(doc.render(&id))).into_response())
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::BadRequest("Document must be a JSON object".to_string())),
        Err(_) => Err(ApiError::BadRequest("invalid UTF-8 JSON".to_string())),
    }
}

async fn put_document(
    State(store): State<SharedStore>,
    Path((db, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut fields = parse_object(&body)?;
    let provided = fields
        .remove("_rev")
        .and_then(|v| v.as_str().map(str::to_string))
        .or_else(|| params.get("rev").cloned());
    fields.remove("_id");
    fields.remove("_attachments");

    let mut store = store.write().await;
    let database = store.database_mut(&db)?;
    database.check_revision(&id, provided.as_deref())?;

    let attachments = database
        .live(&id)
        .map(|d| d.attachments.clone())
        .unwrap_or_default();
    let rev = database.commit(
        &id,
        Document {
            fields,
            attachments,
            ..Document::default()
        },
    );
    debug!(%db, %id, %rev, "document stored");
    Ok(ok_revision(StatusCode::CREATED, &id, &rev))
}

async fn delete_document(
    State(store): State<SharedStore>,
    Path((db, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let mut store = store.write().await;
    let database = store.database_mut(&db)?;
    if database.live(&id).is_none() {
        return Err(ApiError::Missing);
    }
    database.check_revision(&id, params.get("rev").map(String::as_str))?;
    let rev = database.commit(
        &id,
        Document {
            deleted: true,
            ..Document::default()
        },
    );
    debug!(%db, %id, %rev, "document deleted");
    Ok(ok_revision(StatusCode::OK, &id, &rev))
}

async fn get_attachment(
    State(store): State<SharedStore>,
    Path((db, id, name)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let store = store.read().await;
    let doc = store.database(&db)?.live(&id).ok_or(ApiError::Missing)?;
    let att = doc.attachments.get(&name).ok_or(ApiError::Missing)?;
    Ok(([(header::CONTENT_TYPE, att.content_type.clone())], att.data.clone()).into_response())
}

async fn put_attachment(
    State(store): State<SharedStore>,
    Path((db, id, name)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut store = store.write().await;
    let database = store.database_mut(&db)?;
    database.check_revision(&id, params.get("rev").map(String::as_str))?;

    let mut doc = database.live(&id).cloned().unwrap_or_default();
    doc.attachments.insert(
        name,
        Attachment {
            content_type,
            data: body.to_vec(),
        },
    );
    let rev = database.commit(&id, doc);
    Ok(ok_revision(StatusCode::CREATED, &id, &rev))
}

async fn delete_attachment(
    State(store): State<SharedStore>,
    Path((db, id, name)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let mut store = store.write().await;
    let database = store.database_mut(&db)?;
    let mut doc = database.live(&id).cloned().ok_or(ApiError::Missing)?;
    database.check_revision(&id, params.get("rev").map(String::as_str))?;
    if doc.attachments.remove(&name).is_none() {
        return Err(ApiError::Missing);
    }
    let rev = database.commit(&id, doc);
    Ok(ok_revision(StatusCode::OK, &id, &rev))
}

#[derive(Debug, Deserialize)]
pub struct ReplicateRequest {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub create_target: bool,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub cancel: bool,
}

/// Local database name for a replication endpoint (plain name or URL).
pub fn endpoint_database(endpoint: &str) -> &str {
    if endpoint.contains("://") {
        endpoint.trim_end_matches('/').rsplit('/').next().unwrap_or(endpoint)
    } else {
        endpoint
    }
}

async fn replicate(State(store): State<SharedStore>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: ReplicateRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if request.cancel {
        return Ok(Json(json!({ "ok": true })));
    }

    let source = endpoint_database(&request.source).to_string();
    let target = endpoint_database(&request.target).to_string();

    let mut store = store.write().await;
    let documents: Vec<(String, Document)> = store
        .database(&source)?
        .documents
        .iter()
        .filter(|(_, d)| !d.deleted)
        .map(|(id, d)| (id.clone(), d.clone()))
        .collect();
    let source_last_seq = store.database(&source)?.seq;

    if !store.databases.contains_key(&target) {
        if !request.create_target {
            return Err(ApiError::NoDatabase);
        }
        store.databases.insert(target.clone(), Database::default());
    }
    let database = store.database_mut(&target)?;
    let mut docs_written = 0;
    for (id, doc) in documents {
        if database.live(&id).is_some_and(|d| d.rev == doc.rev) {
            continue;
        }
        let rev = doc.rev.clone();
        database.documents.insert(id.clone(), doc);
        database.record(&id, &rev, false);
        docs_written += 1;
    }
    info!(%source, %target, docs_written, "replicated");

    let session_id = Uuid::new_v4().simple().to_string();
    if request.continuous {
        return Ok(Json(json!({ "ok": true, "_local_id": session_id })));
    }
    Ok(Json(json!({
        "ok": true,
        "session_id": session_id,
        "source_last_seq": source_last_seq,
        "history": [{ "docs_written": docs_written }],
    })))
}
