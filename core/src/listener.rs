//! Continuous change-feed subscription with revision deduplication.
//!
//! # Design
//! `Subscription` is the pure half: query parameters, the feed decoder
//! output handling, the per-document revision map and the connection state
//! machine. `Listener` is the runtime half: one tokio task that connects,
//! streams, and after *any* termination (clean EOF, transport error, or a
//! server-reported error row) waits a fixed delay and connects again with
//! the same parameters. The only way out of the loop is `stop()` or drop.
//!
//! A server-reported error row terminates the current stream after being
//! surfaced as `ListenerEvent::Failed`; the normal restart path follows.
//!
//! The revision map outlives individual connections, so replays of the
//! feed after a reconnect do not produce duplicate notifications.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::segment;
use crate::config::ClientConfig;
use crate::server::ServerIdentity;
use crate::transport::Transport;
use crate::types::{ChangeRow, ServerError};

/// Connection state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Connecting,
    Streaming,
}

/// What a single feed fragment amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A revision not seen before for this document.
    Changed { document_id: String, revision: String },
    /// The server wrote an error object into the feed.
    Failed {
        document_id: Option<String>,
        error: String,
        reason: Option<String>,
    },
}

impl FeedEvent {
    /// Error rows end the current stream.
    pub fn terminates_stream(&self) -> bool {
        matches!(self, FeedEvent::Failed { .. })
    }
}

/// Notification delivered to the owner of a `Listener`.
pub type ListenerEvent = FeedEvent;

/// Splits a byte stream into newline-delimited fragments.
#[derive(Debug, Default)]
pub struct FeedDecoder {
    buffer: Vec<u8>,
}

impl FeedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completed. Blank lines
    /// (heartbeats) are skipped; a trailing partial line is kept.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = trim(&line[..line.len() - 1]);
            if !line.is_empty() {
                lines.push(line.to_vec());
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = trim(&rest);
        (!rest.is_empty()).then(|| rest.to_vec())
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// State of one change-feed subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    database: String,
    document_id: Option<String>,
    parameters: BTreeMap<String, String>,
    revisions: HashMap<String, String>,
    state: ListenerState,
    restart_delay: Duration,
}

impl Subscription {
    pub fn new(database: &str, document_id: Option<&str>, config: &ClientConfig) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("feed".to_string(), "continuous".to_string());
        parameters.insert("heartbeat".to_string(), config.heartbeat_ms.to_string());
        parameters.insert("timeout".to_string(), config.feed_timeout_ms.to_string());

        let document_id = document_id.filter(|id| !id.is_empty()).map(str::to_string);
        if let Some(id) = &document_id {
            parameters.insert("filter".to_string(), config.document_filter.clone());
            parameters.insert("name".to_string(), id.clone());
        }

        Self {
            database: database.to_string(),
            document_id,
            parameters,
            revisions: HashMap::new(),
            state: ListenerState::Idle,
            restart_delay: config.listener_restart_delay,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Add or override a query parameter of the feed request.
    pub fn set_param(&mut self, name: &str, value: &str) {
        self.parameters.insert(name.to_string(), value.to_string());
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    /// Last revision seen for `document_id`, or for the tracked document
    /// when `None`.
    pub fn revision(&self, document_id: Option<&str>) -> Option<&str> {
        let id = document_id.or(self.document_id.as_deref())?;
        self.revisions.get(id).map(String::as_str)
    }

    /// `{base}/{db}/_changes?...` with parameters in name order.
    pub fn changes_url(&self, base_url: &str) -> String {
        let query: Vec<String> = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", segment(k), segment(v)))
            .collect();
        format!("{}/{}/_changes?{}", base_url, segment(&self.database), query.join("&"))
    }

    pub fn begin_connect(&mut self) {
        self.state = ListenerState::Connecting;
    }

    pub fn on_stream_open(&mut self) {
        self.state = ListenerState::Streaming;
    }

    /// The exchange is over, however it ended. Returns the delay after
    /// which the next connection must be attempted.
    pub fn on_stream_end(&mut self) -> Duration {
        self.state = ListenerState::Idle;
        self.restart_delay
    }

    /// Interpret one feed fragment.
    pub fn apply(&mut self, fragment: &[u8]) -> Option<FeedEvent> {
        let value: Value = serde_json::from_slice(fragment).ok()?;
        if value.get("error").is_some() {
            let err: ServerError = serde_json::from_value(value).ok()?;
            return Some(FeedEvent::Failed {
                document_id: err.id.or_else(|| self.document_id.clone()),
                error: err.error,
                reason: err.reason,
            });
        }

        let row: ChangeRow = serde_json::from_value(value).ok()?;
        let revision = row.changes.into_iter().next()?.rev;
        let document_id = row.id.or_else(|| self.document_id.clone())?;

        if self.revisions.get(&document_id) == Some(&revision) {
            return None;
        }
        self.revisions.insert(document_id.clone(), revision.clone());
        Some(FeedEvent::Changed { document_id, revision })
    }
}

/// Handle to a running (or stopped) change-feed subscription.
///
/// Dropping the handle stops the subscription.
pub struct Listener {
    subscription: Arc<Mutex<Subscription>>,
    transport: Arc<dyn Transport>,
    server: Arc<RwLock<ServerIdentity>>,
    events_tx: mpsc::UnboundedSender<ListenerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ListenerEvent>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("subscription", &*self.subscription.lock())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Listener {
    /// `server` is read again on every connect, so changes made through
    /// the owning client reach the next reconnect.
    pub fn new(transport: Arc<dyn Transport>, server: Arc<RwLock<ServerIdentity>>, subscription: Subscription) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            subscription: Arc::new(Mutex::new(subscription)),
            transport,
            server,
            events_tx,
            events_rx: Some(events_rx),
            task: None,
        }
    }

    pub fn database(&self) -> String {
        self.subscription.lock().database().to_string()
    }

    pub fn document_id(&self) -> Option<String> {
        self.subscription.lock().document_id().map(str::to_string)
    }

    pub fn state(&self) -> ListenerState {
        self.subscription.lock().state()
    }

    /// Takes effect on the next (re)connect.
    pub fn set_param(&self, name: &str, value: &str) {
        self.subscription.lock().set_param(name, value);
    }

    pub fn revision(&self, document_id: Option<&str>) -> Option<String> {
        self.subscription.lock().revision(document_id).map(str::to_string)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Launch the subscription. The first connection is made after the
    /// restart delay. Calling `start` on a running listener does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let task = run(
            self.subscription.clone(),
            self.transport.clone(),
            self.server.clone(),
            self.events_tx.clone(),
        );
        self.task = Some(tokio::spawn(task));
    }

    /// Abort the active stream and any pending restart.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.subscription.lock().on_stream_end();
    }

    /// Wait for the next notification.
    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        self.events_rx.as_mut()?.recv().await
    }

    /// Hand the notification channel to another owner.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
        self.events_rx.take()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    subscription: Arc<Mutex<Subscription>>,
    transport: Arc<dyn Transport>,
    server: Arc<RwLock<ServerIdentity>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    let mut delay = subscription.lock().restart_delay();
    loop {
        tokio::time::sleep(delay).await;

        let identity = server.read().clone();
        let url = {
            let mut sub = subscription.lock();
            sub.begin_connect();
            sub.changes_url(&identity.base_url())
        };
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(token) = identity.credential_token() {
            headers.push(("Authorization".to_string(), format!("Basic {token}")));
        }

        info!(%url, "listening to changes");
        match transport.open_stream(&url, &headers).await {
            Ok(mut stream) => {
                subscription.lock().on_stream_open();
                let mut decoder = FeedDecoder::new();
                let mut terminated = false;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for line in decoder.push(&bytes) {
                                if dispatch(&subscription, &events, &line) {
                                    terminated = true;
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(%url, error = %err, "change feed failed");
                            break;
                        }
                    }
                    if terminated {
                        break;
                    }
                }
                if !terminated {
                    if let Some(rest) = decoder.finish() {
                        dispatch(&subscription, &events, &rest);
                    }
                }
            }
            Err(err) => warn!(%url, error = %err, "could not open change feed"),
        }

        delay = subscription.lock().on_stream_end();
        debug!(%url, ?delay, "change feed ended, restarting");
    }
}

/// Apply one fragment and forward its event. Returns true when the
/// fragment terminates the stream.
fn dispatch(
    subscription: &Mutex<Subscription>,
    events: &mpsc::UnboundedSender<ListenerEvent>,
    fragment: &[u8],
) -> bool {
    let event = subscription.lock().apply(fragment);
    let Some(event) = event else {
        return false;
    };
    let terminates = event.terminates_stream();
    match &event {
        FeedEvent::Changed { document_id, revision } => {
            debug!(%document_id, %revision, "change received");
        }
        FeedEvent::Failed { document_id, error, .. } => {
            warn!(?document_id, %error, "change feed reported an error");
        }
    }
    // The owner may have dropped the receiver; the feed keeps running.
    let _ = events.send(event);
    terminates
}
