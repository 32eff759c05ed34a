//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Each type mirrors a core type but uses C-compatible representations:
//! `*mut c_char` instead of `String`, pointer plus length instead of
//! `Vec<u8>`, and enums with explicit discriminants. Conversion functions
//! live here to keep `lib.rs` focused on the `extern "C"` surface.
//!
//! Byte buffers use a null pointer for "absent"; a non-null pointer with
//! length 0 is an empty body.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use couch_core::{
    ClientConfig, CouchClient, Descriptor, FeedDecoder, FeedEvent, HttpMethod, Operation, Outcome, OutcomeStatus,
    Subscription,
};

/// Opaque handle to a `CouchClient`. C callers receive a pointer to this
/// and pass it back into every `couch_build_*` function.
pub struct FfiCouchClient {
    pub(crate) inner: CouchClient,
}

/// Opaque handle to one change-feed subscription driven by the host.
pub struct FfiListener {
    pub(crate) subscription: Subscription,
    pub(crate) decoder: FeedDecoder,
}

impl FfiListener {
    pub(crate) fn new(database: &str, document_id: Option<&str>) -> Self {
        Self {
            subscription: Subscription::new(database, document_id, &ClientConfig::default()),
            decoder: FeedDecoder::new(),
        }
    }

    /// Decode one chunk. A server error row ends the stream: the rest of
    /// the buffered input is discarded and `terminated` is set.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> (Vec<FeedEvent>, bool) {
        let mut events = Vec::new();
        for line in self.decoder.push(chunk) {
            if let Some(event) = self.subscription.apply(&line) {
                let terminates = event.terminates_stream();
                events.push(event);
                if terminates {
                    self.end_stream();
                    return (events, true);
                }
            }
        }
        (events, false)
    }

    /// The host's stream ended; flush whatever partial fragment is left.
    pub(crate) fn finish(&mut self) -> Vec<FeedEvent> {
        let events = self
            .decoder
            .finish()
            .and_then(|rest| self.subscription.apply(&rest))
            .into_iter()
            .collect();
        self.end_stream();
        events
    }

    fn end_stream(&mut self) {
        self.decoder = FeedDecoder::new();
        self.subscription.on_stream_end();
    }
}

/// Heap-allocate a C string. Interior NULs yield an empty string.
pub(crate) fn c_string(s: impl Into<Vec<u8>>) -> *mut c_char {
    CString::new(s).unwrap_or_default().into_raw()
}

pub(crate) fn c_string_opt(s: Option<String>) -> *mut c_char {
    s.map_or(std::ptr::null_mut(), c_string)
}

/// Borrow a caller-provided C string. Invalid UTF-8 reads as empty.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for `'a`.
pub(crate) unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or(""))
    }
}

/// Move a byte vector to the heap for the C side.
fn into_raw_bytes(bytes: Vec<u8>) -> (*mut u8, usize) {
    let len = bytes.len();
    let ptr = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
    (ptr, len)
}

/// Release bytes produced by `into_raw_bytes`.
///
/// # Safety
/// `ptr`/`len` must come from one `into_raw_bytes` call.
pub(crate) unsafe fn free_raw_bytes(ptr: *mut u8, len: usize) {
    if !ptr.is_null() {
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
    }
}

/// Release a C string produced by `c_string`.
///
/// # Safety
/// `ptr` must be null or come from `c_string`.
pub(crate) unsafe fn free_c_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiOperation {
    CheckInstallation = 0,
    StartSession = 1,
    EndSession = 2,
    ListDatabases = 3,
    CreateDatabase = 4,
    DeleteDatabase = 5,
    ListDocuments = 6,
    GetRevision = 7,
    GetDocument = 8,
    PutDocument = 9,
    DeleteDocument = 10,
    PutAttachment = 11,
    DeleteAttachment = 12,
    Replicate = 13,
}

impl From<Operation> for FfiOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::CheckInstallation => FfiOperation::CheckInstallation,
            Operation::StartSession => FfiOperation::StartSession,
            Operation::EndSession => FfiOperation::EndSession,
            Operation::ListDatabases => FfiOperation::ListDatabases,
            Operation::CreateDatabase => FfiOperation::CreateDatabase,
            Operation::DeleteDatabase => FfiOperation::DeleteDatabase,
            Operation::ListDocuments => FfiOperation::ListDocuments,
            Operation::GetRevision => FfiOperation::GetRevision,
            Operation::GetDocument => FfiOperation::GetDocument,
            Operation::PutDocument => FfiOperation::PutDocument,
            Operation::DeleteDocument => FfiOperation::DeleteDocument,
            Operation::PutAttachment => FfiOperation::PutAttachment,
            Operation::DeleteAttachment => FfiOperation::DeleteAttachment,
            Operation::Replicate => FfiOperation::Replicate,
        }
    }
}

impl From<FfiOperation> for Operation {
    fn from(op: FfiOperation) -> Self {
        match op {
            FfiOperation::CheckInstallation => Operation::CheckInstallation,
            FfiOperation::StartSession => Operation::StartSession,
            FfiOperation::EndSession => Operation::EndSession,
            FfiOperation::ListDatabases => Operation::ListDatabases,
            FfiOperation::CreateDatabase => Operation::CreateDatabase,
            FfiOperation::DeleteDatabase => Operation::DeleteDatabase,
            FfiOperation::ListDocuments => Operation::ListDocuments,
            FfiOperation::GetRevision => Operation::GetRevision,
            FfiOperation::GetDocument => Operation::GetDocument,
            FfiOperation::PutDocument => Operation::PutDocument,
            FfiOperation::DeleteDocument => Operation::DeleteDocument,
            FfiOperation::PutAttachment => Operation::PutAttachment,
            FfiOperation::DeleteAttachment => Operation::DeleteAttachment,
            FfiOperation::Replicate => Operation::Replicate,
        }
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// HTTP method as a C enum.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiHttpMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Delete = 3,
    Head = 4,
}

impl From<HttpMethod> for FfiHttpMethod {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => FfiHttpMethod::Get,
            HttpMethod::Post => FfiHttpMethod::Post,
            HttpMethod::Put => FfiHttpMethod::Put,
            HttpMethod::Delete => FfiHttpMethod::Delete,
            HttpMethod::Head => FfiHttpMethod::Head,
        }
    }
}

/// A single HTTP header as a key-value pair of C strings.
#[repr(C)]
pub struct FfiHeader {
    pub key: *mut c_char,
    pub value: *mut c_char,
}

/// An HTTP request described as C-compatible plain data.
///
/// Built by `couch_build_*` functions. The C caller executes the request
/// and passes the response back through `couch_classify` together with
/// `operation`. Retrying a timed-out request means re-sending these exact
/// bytes.
#[repr(C)]
pub struct FfiHttpRequest {
    pub operation: FfiOperation,
    pub method: FfiHttpMethod,
    pub url: *mut c_char,
    pub headers: *mut FfiHeader,
    pub headers_len: u32,
    /// Null when the request has no body.
    pub body: *mut u8,
    pub body_len: usize,
}

impl FfiHttpRequest {
    /// Convert a core `Descriptor` into a heap-allocated `FfiHttpRequest`.
    pub(crate) fn from_core(d: Descriptor) -> *mut Self {
        let (body, body_len) = match d.body() {
            Some(b) => into_raw_bytes(b.to_vec()),
            None => (std::ptr::null_mut(), 0),
        };

        let headers_len = d.headers().len() as u32;
        let headers = if d.headers().is_empty() {
            std::ptr::null_mut()
        } else {
            let ffi_headers: Vec<FfiHeader> = d
                .headers()
                .iter()
                .map(|(k, v)| FfiHeader {
                    key: c_string(k.as_str()),
                    value: c_string(v.as_str()),
                })
                .collect();
            Box::into_raw(ffi_headers.into_boxed_slice()) as *mut FfiHeader
        };

        Box::into_raw(Box::new(FfiHttpRequest {
            operation: d.operation().into(),
            method: d.method().into(),
            url: c_string(d.url()),
            headers,
            headers_len,
            body,
            body_len,
        }))
    }

    /// Release everything `from_core` allocated.
    ///
    /// # Safety
    /// `ptr` must come from `from_core` and not have been freed.
    pub(crate) unsafe fn free(ptr: *mut Self) {
        let req = unsafe { Box::from_raw(ptr) };
        unsafe {
            free_c_string(req.url);
            free_raw_bytes(req.body, req.body_len);
        }
        if !req.headers.is_null() {
            let slice = std::ptr::slice_from_raw_parts_mut(req.headers, req.headers_len as usize);
            let headers = unsafe { Box::from_raw(slice) };
            for h in headers.iter() {
                unsafe {
                    free_c_string(h.key);
                    free_c_string(h.value);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response input (caller-provided, not heap-allocated by us)
// ---------------------------------------------------------------------------

/// A response header provided by the caller.
#[repr(C)]
pub struct FfiResponseHeader {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// An HTTP response described as C-compatible plain data.
///
/// The C caller constructs this after executing a request and passes a
/// pointer to `couch_classify`. The FFI layer reads but does not free these
/// fields. Set `transport_failed` when no response arrived at all.
#[repr(C)]
pub struct FfiHttpResponse {
    pub transport_failed: bool,
    pub status: u16,
    pub headers: *const FfiResponseHeader,
    pub headers_len: u32,
    pub body: *const u8,
    pub body_len: usize,
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Error codes reported by the FFI layer itself. A server-reported error is
/// not an FFI error: it is `Ok` with `status = Error`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    NullArg = 1,
    Panic = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiOutcomeStatus {
    Success = 0,
    Error = 1,
}

impl From<OutcomeStatus> for FfiOutcomeStatus {
    fn from(s: OutcomeStatus) -> Self {
        match s {
            OutcomeStatus::Success => FfiOutcomeStatus::Success,
            OutcomeStatus::Error => FfiOutcomeStatus::Error,
        }
    }
}

/// Classified result of one exchange.
///
/// `http_status` is 0 after a transport failure. `revision` is null when
/// none could be projected. `data` holds the raw response body.
#[repr(C)]
pub struct FfiOutcome {
    pub error_code: FfiErrorCode,
    pub error_message: *mut c_char,
    pub operation: FfiOperation,
    pub status: FfiOutcomeStatus,
    pub http_status: u16,
    pub revision: *mut c_char,
    pub data: *mut u8,
    pub data_len: usize,
}

impl FfiOutcome {
    pub(crate) fn from_core(outcome: Outcome) -> *mut Self {
        let (data, data_len) = if outcome.data.is_empty() {
            (std::ptr::null_mut(), 0)
        } else {
            into_raw_bytes(outcome.data)
        };
        Box::into_raw(Box::new(FfiOutcome {
            error_code: FfiErrorCode::Ok,
            error_message: std::ptr::null_mut(),
            operation: outcome.operation.into(),
            status: outcome.status.into(),
            http_status: outcome.http_status.unwrap_or(0),
            revision: c_string_opt(outcome.revision),
            data,
            data_len,
        }))
    }

    fn failure(operation: FfiOperation, error_code: FfiErrorCode, msg: &str) -> *mut Self {
        Box::into_raw(Box::new(FfiOutcome {
            error_code,
            error_message: c_string(msg),
            operation,
            status: FfiOutcomeStatus::Error,
            http_status: 0,
            revision: std::ptr::null_mut(),
            data: std::ptr::null_mut(),
            data_len: 0,
        }))
    }

    /// Build an error result for a null argument.
    pub(crate) fn null_arg(operation: FfiOperation, name: &str) -> *mut Self {
        Self::failure(operation, FfiErrorCode::NullArg, &format!("null argument: {name}"))
    }

    /// Build an error result for a caught panic.
    pub(crate) fn panic(operation: FfiOperation, msg: &str) -> *mut Self {
        Self::failure(operation, FfiErrorCode::Panic, msg)
    }

    /// # Safety
    /// `ptr` must come from one of the constructors above.
    pub(crate) unsafe fn free(ptr: *mut Self) {
        let outcome = unsafe { Box::from_raw(ptr) };
        unsafe {
            free_c_string(outcome.error_message);
            free_c_string(outcome.revision);
            free_raw_bytes(outcome.data, outcome.data_len);
        }
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiFeedEventKind {
    Changed = 0,
    Failed = 1,
}

/// One change notification. For `Changed`, `document_id` and `revision` are
/// set; for `Failed`, `error` is set and the other fields may be null.
#[repr(C)]
pub struct FfiFeedEvent {
    pub kind: FfiFeedEventKind,
    pub document_id: *mut c_char,
    pub revision: *mut c_char,
    pub error: *mut c_char,
    pub reason: *mut c_char,
}

impl From<FeedEvent> for FfiFeedEvent {
    fn from(event: FeedEvent) -> Self {
        match event {
            FeedEvent::Changed { document_id, revision } => FfiFeedEvent {
                kind: FfiFeedEventKind::Changed,
                document_id: c_string(document_id),
                revision: c_string(revision),
                error: std::ptr::null_mut(),
                reason: std::ptr::null_mut(),
            },
            FeedEvent::Failed {
                document_id,
                error,
                reason,
            } => FfiFeedEvent {
                kind: FfiFeedEventKind::Failed,
                document_id: c_string_opt(document_id),
                revision: std::ptr::null_mut(),
                error: c_string(error),
                reason: c_string_opt(reason),
            },
        }
    }
}

/// Events decoded from one chunk. When `terminated` is set the host must
/// close the stream, wait `restart_delay_ms` and reconnect to the same URL.
#[repr(C)]
pub struct FfiFeedEvents {
    pub events: *mut FfiFeedEvent,
    pub len: u32,
    pub terminated: bool,
    pub restart_delay_ms: u64,
}

impl FfiFeedEvents {
    pub(crate) fn from_core(events: Vec<FeedEvent>, terminated: bool, restart_delay_ms: u64) -> *mut Self {
        let len = events.len() as u32;
        let events = if events.is_empty() {
            std::ptr::null_mut()
        } else {
            let ffi: Vec<FfiFeedEvent> = events.into_iter().map(FfiFeedEvent::from).collect();
            Box::into_raw(ffi.into_boxed_slice()) as *mut FfiFeedEvent
        };
        Box::into_raw(Box::new(FfiFeedEvents {
            events,
            len,
            terminated,
            restart_delay_ms,
        }))
    }

    /// # Safety
    /// `ptr` must come from `from_core` and not have been freed.
    pub(crate) unsafe fn free(ptr: *mut Self) {
        let batch = unsafe { Box::from_raw(ptr) };
        if batch.events.is_null() {
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(batch.events, batch.len as usize);
        let events = unsafe { Box::from_raw(slice) };
        for e in events.iter() {
            unsafe {
                free_c_string(e.document_id);
                free_c_string(e.revision);
                free_c_string(e.error);
                free_c_string(e.reason);
            }
        }
    }
}
