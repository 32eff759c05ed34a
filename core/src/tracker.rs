//! Correlation between in-flight exchanges and the descriptors that spawned
//! them.
//!
//! # Design
//! The tracker is owned by a single actor (the client reactor), so it needs
//! no locking. Each entry is keyed by a fresh `ExchangeHandle`; a timeout
//! resubmission removes the old entry and inserts a new one with a new
//! handle. `complete_and_remove` removes an entry exactly once, which is
//! what makes a completion racing a timeout harmless: whichever event is
//! processed second finds no entry and is dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use crate::descriptor::Descriptor;
use crate::error::TrackerError;

/// Opaque identifier of one concrete exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeHandle(u64);

impl fmt::Display for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One in-flight exchange plus whatever resources the owner attached to it.
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub descriptor: Arc<Descriptor>,
    pub handle: ExchangeHandle,
    /// `None` when no deadline was armed (replication).
    pub deadline: Option<Instant>,
    pub resources: T,
}

#[derive(Debug)]
pub struct RequestTracker<T> {
    next_handle: u64,
    pending: HashMap<ExchangeHandle, PendingRequest<T>>,
    in_flight: HashSet<Uuid>,
}

impl<T> Default for RequestTracker<T> {
    fn default() -> Self {
        Self {
            next_handle: 0,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }
}

impl<T> RequestTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new exchange for `descriptor`.
    ///
    /// `launch` receives the freshly allocated handle and returns the
    /// resources to keep with the entry (typically the spawned exchange and
    /// timer tasks). It is not called when the submission is refused.
    pub fn submit<F>(
        &mut self,
        descriptor: Arc<Descriptor>,
        deadline: Option<Instant>,
        launch: F,
    ) -> Result<ExchangeHandle, TrackerError>
    where
        F: FnOnce(ExchangeHandle) -> T,
    {
        if self.in_flight.contains(&descriptor.id()) {
            return Err(TrackerError::DuplicateSubmission(descriptor.id()));
        }
        self.next_handle += 1;
        let handle = ExchangeHandle(self.next_handle);
        let resources = launch(handle);
        self.in_flight.insert(descriptor.id());
        self.pending.insert(
            handle,
            PendingRequest {
                descriptor,
                handle,
                deadline,
                resources,
            },
        );
        Ok(handle)
    }

    /// Remove the entry for `handle`, handing it back to the caller.
    pub fn complete_and_remove(&mut self, handle: ExchangeHandle) -> Result<PendingRequest<T>, TrackerError> {
        let pending = self
            .pending
            .remove(&handle)
            .ok_or(TrackerError::UnknownHandle(handle))?;
        self.in_flight.remove(&pending.descriptor.id());
        Ok(pending)
    }

    /// Remove every entry. Used on teardown.
    pub fn drain(&mut self) -> Vec<PendingRequest<T>> {
        self.in_flight.clear();
        let mut drained: Vec<_> = self.pending.drain().map(|(_, p)| p).collect();
        drained.sort_by_key(|p| p.handle);
        drained
    }

    pub fn contains(&self, handle: ExchangeHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    pub fn is_tracking(&self, descriptor: &Descriptor) -> bool {
        self.in_flight.contains(&descriptor.id())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use crate::operation::Operation;

    fn descriptor() -> Arc<Descriptor> {
        Arc::new(Descriptor::new(Operation::GetDocument, HttpMethod::Get, "http://h:1/db/doc"))
    }

    #[test]
    fn submit_then_complete_removes_entry() {
        let mut tracker = RequestTracker::new();
        let d = descriptor();
        let handle = tracker.submit(d.clone(), None, |_| "res").unwrap();
        assert!(tracker.contains(handle));
        assert!(tracker.is_tracking(&d));

        let pending = tracker.complete_and_remove(handle).unwrap();
        assert_eq!(pending.resources, "res");
        assert_eq!(pending.descriptor.id(), d.id());
        assert!(tracker.is_empty());
        assert!(!tracker.is_tracking(&d));
    }

    #[test]
    fn second_completion_is_unknown() {
        let mut tracker = RequestTracker::new();
        let handle = tracker.submit(descriptor(), None, |_| ()).unwrap();
        tracker.complete_and_remove(handle).unwrap();
        assert_eq!(
            tracker.complete_and_remove(handle).unwrap_err(),
            TrackerError::UnknownHandle(handle)
        );
    }

    #[test]
    fn duplicate_instance_is_refused_without_launching() {
        let mut tracker = RequestTracker::new();
        let d = descriptor();
        tracker.submit(d.clone(), None, |_| ()).unwrap();

        let mut launched = false;
        let err = tracker
            .submit(d.clone(), None, |_| launched = true)
            .unwrap_err();
        assert_eq!(err, TrackerError::DuplicateSubmission(d.id()));
        assert!(!launched);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn identical_but_distinct_descriptors_may_coexist() {
        let mut tracker = RequestTracker::new();
        tracker.submit(descriptor(), None, |_| ()).unwrap();
        tracker.submit(descriptor(), None, |_| ()).unwrap();
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn resubmission_gets_fresh_handle() {
        let mut tracker = RequestTracker::new();
        let d = descriptor();
        let first = tracker.submit(d.clone(), None, |h| h).unwrap();
        let pending = tracker.complete_and_remove(first).unwrap();
        let second = tracker.submit(pending.descriptor, None, |h| h).unwrap();
        assert_ne!(first, second);
        assert_eq!(tracker.complete_and_remove(second).unwrap().resources, second);
    }

    #[test]
    fn drain_empties_tracker() {
        let mut tracker = RequestTracker::new();
        let a = tracker.submit(descriptor(), None, |_| ()).unwrap();
        let b = tracker.submit(descriptor(), None, |_| ()).unwrap();
        let drained = tracker.drain();
        assert_eq!(drained.iter().map(|p| p.handle).collect::<Vec<_>>(), vec![a, b]);
        assert!(tracker.is_empty());
        assert!(tracker.complete_and_remove(a).is_err());
    }
}
