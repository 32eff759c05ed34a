//! Async client instance: one reactor task per `CouchDb`.
//!
//! # Design
//! Submissions, completions and deadline expiries all travel through one
//! unbounded mpsc channel into a single reactor task, which is the only
//! owner of the `RequestTracker`. Every exchange runs in its own spawned
//! task that reports back with `Command::Completed`; every armed deadline is
//! a sleeping task that reports `Command::Expired`. Whichever of the two the
//! reactor sees first removes the tracker entry and the other one finds
//! nothing, so each logical operation yields exactly one `Outcome`.
//!
//! On expiry the exchange task is aborted and the same `Arc<Descriptor>` is
//! submitted again under a fresh handle and deadline. The caller's reply
//! channel moves with it and never learns about the retry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classify::classify;
use crate::client::{CouchClient, ReplicationOptions};
use crate::config::ClientConfig;
use crate::descriptor::Descriptor;
use crate::error::{ClientError, TrackerError, TransportError};
use crate::http::HttpResponse;
use crate::listener::{Listener, Subscription};
use crate::outcome::Outcome;
use crate::server::ServerIdentity;
use crate::supervisor::{Supervisor, SupervisorState};
use crate::tracker::{ExchangeHandle, RequestTracker};
use crate::transport::Transport;

type Reply = oneshot::Sender<Result<Outcome, ClientError>>;

enum Command {
    Submit { descriptor: Arc<Descriptor>, reply: Reply },
    Completed {
        handle: ExchangeHandle,
        result: Result<HttpResponse, TransportError>,
    },
    Expired { handle: ExchangeHandle },
    Shutdown,
}

/// Resolves once with the outcome of one submitted descriptor.
#[derive(Debug)]
pub struct OutcomeFuture {
    rx: oneshot::Receiver<Result<Outcome, ClientError>>,
}

impl Future for OutcomeFuture {
    type Output = Result<Outcome, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Reply sender dropped: the reactor is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Disposed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client for one CouchDB server.
///
/// Must be created inside a tokio runtime. Dropping it tears down the
/// reactor; pending operations resolve with `ClientError::Disposed`.
pub struct CouchDb<T: Transport> {
    client: CouchClient,
    // Mirror of `client.server()` handed to listeners.
    shared_server: Arc<RwLock<ServerIdentity>>,
    config: ClientConfig,
    transport: Arc<T>,
    commands: mpsc::UnboundedSender<Command>,
    reactor: Option<JoinHandle<()>>,
}

impl<T: Transport> std::fmt::Debug for CouchDb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchDb")
            .field("server", self.client.server())
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Transport> CouchDb<T> {
    pub fn new(server: ServerIdentity, config: ClientConfig, transport: T) -> Self {
        let transport = Arc::new(transport);
        let (commands, rx) = mpsc::unbounded_channel();
        let reactor = Reactor {
            transport: transport.clone(),
            supervisor: Supervisor::new(config.request_timeout),
            tracker: RequestTracker::new(),
            commands: commands.clone(),
        };
        Self {
            shared_server: Arc::new(RwLock::new(server.clone())),
            client: CouchClient::new(server),
            config,
            transport,
            commands,
            reactor: Some(tokio::spawn(reactor.run(rx))),
        }
    }

    pub fn server(&self) -> &ServerIdentity {
        self.client.server()
    }

    pub fn set_server(&mut self, server: ServerIdentity) {
        *self.client.server_mut() = server;
        self.publish_server();
    }

    /// Change the target server. The credential is only replaced when both
    /// `username` and `password` are non-empty. Applies to operations
    /// submitted afterwards.
    pub fn set_server_configuration(&mut self, host: &str, port: u16, username: &str, password: &str) {
        let server = self.client.server_mut();
        server.set_host(host);
        server.set_port(port);
        server.set_credential(username, password);
        self.publish_server();
    }

    fn publish_server(&self) {
        *self.shared_server.write() = self.client.server().clone();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The descriptor builder bound to the current server.
    pub fn builder(&self) -> &CouchClient {
        &self.client
    }

    /// Hand a descriptor to the reactor. Never blocks.
    pub fn submit(&self, descriptor: impl Into<Arc<Descriptor>>) -> OutcomeFuture {
        let (reply, rx) = oneshot::channel();
        let descriptor = descriptor.into();
        if self.commands.send(Command::Submit { descriptor, reply }).is_err() {
            debug!("submit after shutdown");
        }
        OutcomeFuture { rx }
    }

    pub async fn check_installation(&self) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_check_installation()).await
    }

    pub async fn start_session(&self, username: &str, password: &str) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_start_session(username, password)).await
    }

    pub async fn end_session(&self) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_end_session()).await
    }

    pub async fn list_databases(&self) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_list_databases()).await
    }

    pub async fn create_database(&self, database: &str) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_create_database(database)).await
    }

    pub async fn delete_database(&self, database: &str) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_delete_database(database)).await
    }

    pub async fn list_documents(&self, database: &str) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_list_documents(database)).await
    }

    pub async fn get_revision(&self, database: &str, document_id: &str) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_get_revision(database, document_id)).await
    }

    pub async fn get_document(&self, database: &str, document_id: &str) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_get_document(database, document_id)).await
    }

    pub async fn put_document(
        &self,
        database: &str,
        document_id: &str,
        document: Vec<u8>,
    ) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_put_document(database, document_id, document))
            .await
    }

    pub async fn put_json<D: serde::Serialize>(
        &self,
        database: &str,
        document_id: &str,
        document: &D,
    ) -> Result<Outcome, ClientError> {
        let descriptor = self.client.build_put_json(database, document_id, document)?;
        self.submit(descriptor).await
    }

    pub async fn delete_document(
        &self,
        database: &str,
        document_id: &str,
        revision: &str,
    ) -> Result<Outcome, ClientError> {
        self.submit(self.client.build_delete_document(database, document_id, revision))
            .await
    }

    pub async fn put_attachment(
        &self,
        database: &str,
        document_id: &str,
        attachment_name: &str,
        attachment: Vec<u8>,
        mime_type: &str,
        revision: &str,
    ) -> Result<Outcome, ClientError> {
        let descriptor = self.client.build_put_attachment(
            database,
            document_id,
            attachment_name,
            attachment,
            mime_type,
            revision,
        );
        self.submit(descriptor).await
    }

    pub async fn delete_attachment(
        &self,
        database: &str,
        document_id: &str,
        attachment_name: &str,
        revision: &str,
    ) -> Result<Outcome, ClientError> {
        let descriptor = self
            .client
            .build_delete_attachment(database, document_id, attachment_name, revision);
        self.submit(descriptor).await
    }

    /// Pull `source_database` on `source` into the local `target_database`.
    pub async fn replicate_from(
        &self,
        source: &ServerIdentity,
        source_database: &str,
        target_database: &str,
        options: ReplicationOptions,
    ) -> Result<Outcome, ClientError> {
        let descriptor = self
            .client
            .build_replicate_from(source, source_database, target_database, options)?;
        self.submit(descriptor).await
    }

    /// Push the local `source_database` to `target_database` on `target`.
    pub async fn replicate_to(
        &self,
        target: &ServerIdentity,
        source_database: &str,
        target_database: &str,
        options: ReplicationOptions,
    ) -> Result<Outcome, ClientError> {
        let descriptor = self
            .client
            .build_replicate_to(target, source_database, target_database, options)?;
        self.submit(descriptor).await
    }

    /// A change listener on `database`, optionally narrowed to one document.
    /// The listener shares this client's transport and server identity and
    /// is not started yet. Server changes apply from its next connect.
    pub fn create_listener(&self, database: &str, document_id: Option<&str>) -> Listener {
        let subscription = Subscription::new(database, document_id, &self.config);
        let transport: Arc<dyn Transport> = self.transport.clone();
        Listener::new(transport, self.shared_server.clone(), subscription)
    }

    /// Abort every in-flight exchange and stop the reactor.
    pub fn shutdown(&mut self) {
        if self.reactor.take().is_some() {
            // The reactor may already be gone; nothing is left to tear down.
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

impl<T: Transport> Drop for CouchDb<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resources attached to one tracked exchange. Dropping the entry aborts
/// whatever is still running.
struct Exchange {
    reply: Option<Reply>,
    task: JoinHandle<()>,
    timer: Option<JoinHandle<()>>,
    state: SupervisorState,
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct Reactor<T: Transport> {
    transport: Arc<T>,
    supervisor: Supervisor,
    tracker: RequestTracker<Exchange>,
    commands: mpsc::UnboundedSender<Command>,
}

impl<T: Transport> Reactor<T> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit { descriptor, reply } => self.submit(descriptor, reply),
                Command::Completed { handle, result } => self.complete(handle, result),
                Command::Expired { handle } => self.expire(handle),
                Command::Shutdown => break,
            }
        }
        let dropped = self.tracker.drain();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "client disposed with exchanges in flight");
        }
    }

    fn submit(&mut self, descriptor: Arc<Descriptor>, reply: Reply) {
        if self.tracker.is_tracking(&descriptor) {
            let err = TrackerError::DuplicateSubmission(descriptor.id());
            warn!(operation = %descriptor.operation(), error = %err, "submission refused");
            let _ = reply.send(Err(ClientError::Tracker(err)));
            return;
        }

        let deadline = self.supervisor.arm(descriptor.operation(), Instant::now());
        let transport = self.transport.clone();
        let commands = self.commands.clone();
        let request = descriptor.clone();

        let submitted = self.tracker.submit(descriptor.clone(), deadline, move |handle| {
            debug!(operation = %request.operation(), url = request.url(), %handle, "invoked url");
            let exchange = transport.issue(&request);
            let done = commands.clone();
            let task = tokio::spawn(async move {
                let result = exchange.await;
                let _ = done.send(Command::Completed { handle, result });
            });
            let timer = deadline.map(|at| {
                tokio::spawn(async move {
                    tokio::time::sleep_until(at).await;
                    let _ = commands.send(Command::Expired { handle });
                })
            });
            Exchange {
                reply: Some(reply),
                task,
                timer,
                state: SupervisorState::Armed,
            }
        });

        if let Err(err) = submitted {
            warn!(operation = %descriptor.operation(), error = %err, "tracker refused submission");
        }
    }

    fn complete(&mut self, handle: ExchangeHandle, result: Result<HttpResponse, TransportError>) {
        let mut pending = match self.tracker.complete_and_remove(handle) {
            Ok(pending) => pending,
            Err(err) => {
                debug!(error = %err, "late completion ignored");
                return;
            }
        };
        pending.resources.state = pending.resources.state.on_completed();
        let operation = pending.descriptor.operation();
        if let Err(err) = &result {
            warn!(%operation, url = pending.descriptor.url(), error = %err, "exchange failed");
        }
        let outcome = classify(operation, result);
        if let Some(reply) = pending.resources.reply.take() {
            // The caller may have stopped waiting.
            let _ = reply.send(Ok(outcome));
        }
    }

    fn expire(&mut self, handle: ExchangeHandle) {
        let mut pending = match self.tracker.complete_and_remove(handle) {
            Ok(pending) => pending,
            Err(err) => {
                debug!(error = %err, "late deadline ignored");
                return;
            }
        };
        pending.resources.state = pending.resources.state.on_deadline();
        if !pending.resources.state.needs_resubmission() {
            return;
        }
        let Some(reply) = pending.resources.reply.take() else {
            return;
        };
        let descriptor = pending.descriptor.clone();
        warn!(
            operation = %descriptor.operation(),
            url = descriptor.url(),
            timeout = ?self.supervisor.timeout(),
            "request timed out, retrying"
        );
        drop(pending);
        self.submit(descriptor, reply);
    }
}
