//! Client access layer for the CouchDB HTTP API.
//!
//! # Overview
//! Two layers share one vocabulary of operations:
//!
//! - A deterministic core: `CouchClient` builds `Descriptor` values and
//!   `classify` turns an `HttpResponse` into an `Outcome` without touching
//!   the network (host-does-IO pattern). The FFI crate exposes only this
//!   half, so a foreign host performs the HTTP round-trip itself.
//! - An async client: `CouchDb` runs a reactor task that issues exchanges
//!   through a `Transport`, correlates completions with the operation that
//!   spawned them, and retries timed-out requests silently. `Listener` keeps
//!   a continuous `_changes` feed open and deduplicates notifications by
//!   revision.
//!
//! # Design
//! - One reactor per `CouchDb`; the request tracker is owned by it alone.
//! - Server-reported failures are not Rust errors; they classify to an
//!   error `Outcome`, like a transport failure.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod classify;
pub mod client;
pub mod config;
pub mod couchdb;
pub mod descriptor;
pub mod error;
pub mod http;
pub mod listener;
pub mod operation;
pub mod outcome;
pub mod server;
pub mod supervisor;
pub mod tracker;
pub mod transport;
pub mod types;

pub use classify::classify;
pub use client::{CouchClient, ReplicationOptions};
pub use config::ClientConfig;
pub use couchdb::{CouchDb, OutcomeFuture};
pub use descriptor::Descriptor;
pub use error::{ApiError, ClientError, TrackerError, TransportError};
pub use http::{HttpMethod, HttpResponse};
pub use listener::{FeedDecoder, FeedEvent, Listener, ListenerEvent, ListenerState, Subscription};
pub use operation::Operation;
pub use outcome::{Outcome, OutcomeStatus};
pub use server::ServerIdentity;
pub use transport::{ByteStream, ReqwestTransport, Transport};
pub use types::{ChangeRow, ReplicationRequest, ServerError};
