//! C-ABI wrapper around `couch-core`.
//!
//! # Overview
//! Exposes the deterministic half of the client through `extern "C"`
//! functions: build a request for any operation, classify the response the
//! host received, and decode a change feed the host is streaming. The host
//! performs all network I/O itself and owns the timers, so nothing here
//! links a runtime.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - One `couch_build_*` per operation mirrors `CouchClient` 1:1; every
//!   request carries its operation tag so `couch_classify` needs nothing
//!   else.
//! - The C caller owns all returned pointers and must call the matching
//!   `couch_free_*` function to release them.

pub mod types;

use std::os::raw::c_char;
use std::panic::{catch_unwind, UnwindSafe};

use couch_core::{classify, CouchClient, Descriptor, HttpResponse, ReplicationOptions, ServerIdentity, TransportError};

use types::*;

/// Borrow a caller-provided byte buffer. A null pointer is only accepted
/// together with a zero length.
///
/// # Safety
/// Non-null `ptr` must point to `len` readable bytes valid for `'a`.
unsafe fn bytes_arg<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    if ptr.is_null() {
        (len == 0).then_some(&[][..])
    } else {
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }
}

fn server_from_args(
    host: *const c_char,
    port: u16,
    secure: bool,
    username: *const c_char,
    password: *const c_char,
) -> Option<ServerIdentity> {
    let host = unsafe { str_arg(host) }?;
    let mut server = ServerIdentity::new(host, port).with_secure(secure);
    if let (Some(user), Some(pass)) = unsafe { (str_arg(username), str_arg(password)) } {
        server.set_credential(user, pass);
    }
    Some(server)
}

// ---------------------------------------------------------------------------
// Client lifecycle
// ---------------------------------------------------------------------------

/// Create a client bound to one server.
///
/// `username` and `password` may be null; the credential is only set when
/// both are non-empty. Returns null if `host` is null or if an internal
/// panic occurs. The caller must free the returned pointer with
/// `couch_client_free`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_client_new(
    host: *const c_char,
    port: u16,
    secure: bool,
    username: *const c_char,
    password: *const c_char,
) -> *mut FfiCouchClient {
    catch_unwind(|| match server_from_args(host, port, secure, username, password) {
        Some(server) => Box::into_raw(Box::new(FfiCouchClient {
            inner: CouchClient::new(server),
        })),
        None => std::ptr::null_mut(),
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Repoint an existing client. Requests built afterwards use the new
/// server. Returns false if `client` or `host` is null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_client_set_server(
    client: *mut FfiCouchClient,
    host: *const c_char,
    port: u16,
    username: *const c_char,
    password: *const c_char,
) -> bool {
    catch_unwind(|| {
        if client.is_null() {
            return false;
        }
        let Some(host) = (unsafe { str_arg(host) }) else {
            return false;
        };
        let server = unsafe { &mut *client }.inner.server_mut();
        server.set_host(host);
        server.set_port(port);
        if let (Some(user), Some(pass)) = unsafe { (str_arg(username), str_arg(password)) } {
            server.set_credential(user, pass);
        }
        true
    })
    .unwrap_or(false)
}

/// Free a client created by `couch_client_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_client_free(client: *mut FfiCouchClient) {
    if !client.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { Box::from_raw(client) });
        });
    }
}

// ---------------------------------------------------------------------------
// Build request functions
// ---------------------------------------------------------------------------

/// Shared body of every `couch_build_*`: null checks, panic guard and
/// conversion. `build` returns `None` when a required argument is null.
fn build_with<F>(client: *const FfiCouchClient, build: F) -> *mut FfiHttpRequest
where
    F: FnOnce(&CouchClient) -> Option<Descriptor> + UnwindSafe,
{
    catch_unwind(|| {
        if client.is_null() {
            return std::ptr::null_mut();
        }
        let client = unsafe { &*client };
        match build(&client.inner) {
            Some(d) => FfiHttpRequest::from_core(d),
            None => std::ptr::null_mut(),
        }
    })
    .unwrap_or(std::ptr::null_mut())
}

/// `GET /`. Returns null if `client` is null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_build_check_installation(client: *const FfiCouchClient) -> *mut FfiHttpRequest {
    build_with(client, |c| Some(c.build_check_installation()))
}

/// `POST /_session` with form-encoded credentials.
#[unsafe(no_mangle)]
pub extern "C" fn couch_build_start_session(
    client: *const FfiCouchClient,
    username: *const c_char,
    password: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (username, password) = unsafe { (str_arg(username)?, str_arg(password)?) };
        Some(c.build_start_session(username, password))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_end_session(client: *const FfiCouchClient) -> *mut FfiHttpRequest {
    build_with(client, |c| Some(c.build_end_session()))
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_list_databases(client: *const FfiCouchClient) -> *mut FfiHttpRequest {
    build_with(client, |c| Some(c.build_list_databases()))
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_create_database(
    client: *const FfiCouchClient,
    database: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| Some(c.build_create_database(unsafe { str_arg(database) }?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_delete_database(
    client: *const FfiCouchClient,
    database: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| Some(c.build_delete_database(unsafe { str_arg(database) }?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_list_documents(
    client: *const FfiCouchClient,
    database: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| Some(c.build_list_documents(unsafe { str_arg(database) }?)))
}

/// `HEAD /{db}/{doc}`; classify the response to read the revision.
#[unsafe(no_mangle)]
pub extern "C" fn couch_build_get_revision(
    client: *const FfiCouchClient,
    database: *const c_char,
    document_id: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (database, document_id) = unsafe { (str_arg(database)?, str_arg(document_id)?) };
        Some(c.build_get_revision(database, document_id))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_get_document(
    client: *const FfiCouchClient,
    database: *const c_char,
    document_id: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (database, document_id) = unsafe { (str_arg(database)?, str_arg(document_id)?) };
        Some(c.build_get_document(database, document_id))
    })
}

/// PUT a JSON document given as raw bytes. Updates must carry `_rev`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_build_put_document(
    client: *const FfiCouchClient,
    database: *const c_char,
    document_id: *const c_char,
    document: *const u8,
    document_len: usize,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (database, document_id) = unsafe { (str_arg(database)?, str_arg(document_id)?) };
        let document = unsafe { bytes_arg(document, document_len) }?;
        Some(c.build_put_document(database, document_id, document.to_vec()))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_delete_document(
    client: *const FfiCouchClient,
    database: *const c_char,
    document_id: *const c_char,
    revision: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (database, document_id, revision) =
            unsafe { (str_arg(database)?, str_arg(document_id)?, str_arg(revision)?) };
        Some(c.build_delete_document(database, document_id, revision))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_put_attachment(
    client: *const FfiCouchClient,
    database: *const c_char,
    document_id: *const c_char,
    attachment_name: *const c_char,
    attachment: *const u8,
    attachment_len: usize,
    mime_type: *const c_char,
    revision: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (database, document_id, attachment_name) =
            unsafe { (str_arg(database)?, str_arg(document_id)?, str_arg(attachment_name)?) };
        let (mime_type, revision) = unsafe { (str_arg(mime_type)?, str_arg(revision)?) };
        let attachment = unsafe { bytes_arg(attachment, attachment_len) }?;
        Some(c.build_put_attachment(
            database,
            document_id,
            attachment_name,
            attachment.to_vec(),
            mime_type,
            revision,
        ))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn couch_build_delete_attachment(
    client: *const FfiCouchClient,
    database: *const c_char,
    document_id: *const c_char,
    attachment_name: *const c_char,
    revision: *const c_char,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        let (database, document_id, attachment_name, revision) = unsafe {
            (
                str_arg(database)?,
                str_arg(document_id)?,
                str_arg(attachment_name)?,
                str_arg(revision)?,
            )
        };
        Some(c.build_delete_attachment(database, document_id, attachment_name, revision))
    })
}

/// Pull `source_database` from the server of `remote` into the local
/// `target_database`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_build_replicate_from(
    client: *const FfiCouchClient,
    remote: *const FfiCouchClient,
    source_database: *const c_char,
    target_database: *const c_char,
    create_target: bool,
    continuous: bool,
    cancel: bool,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        if remote.is_null() {
            return None;
        }
        let remote = unsafe { &*remote }.inner.server();
        let (source, target) = unsafe { (str_arg(source_database)?, str_arg(target_database)?) };
        let options = ReplicationOptions {
            create_target,
            continuous,
            cancel,
        };
        c.build_replicate_from(remote, source, target, options).ok()
    })
}

/// Push the local `source_database` to `target_database` on the server of
/// `remote`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_build_replicate_to(
    client: *const FfiCouchClient,
    remote: *const FfiCouchClient,
    source_database: *const c_char,
    target_database: *const c_char,
    create_target: bool,
    continuous: bool,
    cancel: bool,
) -> *mut FfiHttpRequest {
    build_with(client, |c| {
        if remote.is_null() {
            return None;
        }
        let remote = unsafe { &*remote }.inner.server();
        let (source, target) = unsafe { (str_arg(source_database)?, str_arg(target_database)?) };
        let options = ReplicationOptions {
            create_target,
            continuous,
            cancel,
        };
        c.build_replicate_to(remote, source, target, options).ok()
    })
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Convert an `FfiHttpResponse` to the core result type.
fn ffi_response_to_core(resp: &FfiHttpResponse) -> Result<HttpResponse, TransportError> {
    if resp.transport_failed {
        return Err(TransportError::new("transport failure reported by host"));
    }
    let body = unsafe { bytes_arg(resp.body, resp.body_len) }.unwrap_or_default();
    let mut response = HttpResponse::new(resp.status, body.to_vec());
    if !resp.headers.is_null() {
        let headers = unsafe { std::slice::from_raw_parts(resp.headers, resp.headers_len as usize) };
        for h in headers {
            if let (Some(k), Some(v)) = unsafe { (str_arg(h.key), str_arg(h.value)) } {
                response = response.with_header(k, v);
            }
        }
    }
    Ok(response)
}

/// Classify the response to a request built for `operation`.
///
/// Always returns an outcome; `error_code` is only non-`Ok` for a null
/// `response` or an internal panic.
#[unsafe(no_mangle)]
pub extern "C" fn couch_classify(operation: FfiOperation, response: *const FfiHttpResponse) -> *mut FfiOutcome {
    catch_unwind(|| {
        if response.is_null() {
            return FfiOutcome::null_arg(operation, "response");
        }
        let resp = unsafe { &*response };
        FfiOutcome::from_core(classify(operation.into(), ffi_response_to_core(resp)))
    })
    .unwrap_or_else(|_| FfiOutcome::panic(operation, "panic in couch_classify"))
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// Create a change-feed subscription on `database`. `document_id` may be
/// null to follow every document. Returns null if `database` is null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_new(database: *const c_char, document_id: *const c_char) -> *mut FfiListener {
    catch_unwind(|| {
        let Some(database) = (unsafe { str_arg(database) }) else {
            return std::ptr::null_mut();
        };
        let document_id = unsafe { str_arg(document_id) };
        Box::into_raw(Box::new(FfiListener::new(database, document_id)))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Add or override a query parameter; applies from the next URL.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_set_param(listener: *mut FfiListener, name: *const c_char, value: *const c_char) -> bool {
    catch_unwind(|| {
        if listener.is_null() {
            return false;
        }
        let (Some(name), Some(value)) = (unsafe { str_arg(name) }, unsafe { str_arg(value) }) else {
            return false;
        };
        unsafe { &mut *listener }.subscription.set_param(name, value);
        true
    })
    .unwrap_or(false)
}

/// The `_changes` URL to GET on `client`'s server, marking the
/// subscription as connecting. Free with `couch_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_url(listener: *mut FfiListener, client: *const FfiCouchClient) -> *mut c_char {
    catch_unwind(|| {
        if listener.is_null() || client.is_null() {
            return std::ptr::null_mut();
        }
        let listener = unsafe { &mut *listener };
        let client = unsafe { &*client };
        listener.subscription.begin_connect();
        c_string(listener.subscription.changes_url(&client.inner.server().base_url()))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Feed one received chunk. Returns the notifications it completed.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_feed(listener: *mut FfiListener, bytes: *const u8, len: usize) -> *mut FfiFeedEvents {
    catch_unwind(|| {
        if listener.is_null() {
            return std::ptr::null_mut();
        }
        let Some(chunk) = (unsafe { bytes_arg(bytes, len) }) else {
            return std::ptr::null_mut();
        };
        let listener = unsafe { &mut *listener };
        listener.subscription.on_stream_open();
        let (events, terminated) = listener.feed(chunk);
        let delay = listener.subscription.restart_delay().as_millis() as u64;
        FfiFeedEvents::from_core(events, terminated, delay)
    })
    .unwrap_or(std::ptr::null_mut())
}

/// The host's stream ended or failed. Flushes a trailing fragment; the
/// result is always `terminated`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_finish(listener: *mut FfiListener) -> *mut FfiFeedEvents {
    catch_unwind(|| {
        if listener.is_null() {
            return std::ptr::null_mut();
        }
        let listener = unsafe { &mut *listener };
        let events = listener.finish();
        let delay = listener.subscription.restart_delay().as_millis() as u64;
        FfiFeedEvents::from_core(events, true, delay)
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Last revision seen for `document_id` (or the tracked document when
/// null). Returns null when none. Free with `couch_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_revision(listener: *const FfiListener, document_id: *const c_char) -> *mut c_char {
    catch_unwind(|| {
        if listener.is_null() {
            return std::ptr::null_mut();
        }
        let listener = unsafe { &*listener };
        let document_id = unsafe { str_arg(document_id) };
        c_string_opt(listener.subscription.revision(document_id).map(str::to_string))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a listener created by `couch_listener_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_listener_free(listener: *mut FfiListener) {
    if !listener.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { Box::from_raw(listener) });
        });
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free an `FfiHttpRequest` returned by any `couch_build_*` function.
/// Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_free_request(req: *mut FfiHttpRequest) {
    if !req.is_null() {
        let _ = catch_unwind(|| unsafe { FfiHttpRequest::free(req) });
    }
}

/// Free an `FfiOutcome` returned by `couch_classify`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_free_outcome(outcome: *mut FfiOutcome) {
    if !outcome.is_null() {
        let _ = catch_unwind(|| unsafe { FfiOutcome::free(outcome) });
    }
}

/// Free an `FfiFeedEvents` batch. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_free_feed_events(events: *mut FfiFeedEvents) {
    if !events.is_null() {
        let _ = catch_unwind(|| unsafe { FfiFeedEvents::free(events) });
    }
}

/// Free a C string allocated by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn couch_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| unsafe { free_c_string(s) });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
