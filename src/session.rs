//! Load Balancing Session
//!
//! Per unit-of-work state deciding whether queries must go to the primary.
//! A session lives as long as one request or job and is dropped with it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::database::WriteLocation;

/// Routing state for one unit of work
#[derive(Debug, Default)]
pub struct Session {
    /// Pinned to the primary by `force_primary` or a `use_primary` block
    use_primary: AtomicBool,
    /// Pinned to the primary because this unit of work wrote
    write_pinned: AtomicBool,
    performed_write: AtomicBool,
    ignore_writes: AtomicBool,
    use_replicas_for_read_queries: AtomicBool,
    fallback_to_replicas_for_ambiguous_queries: AtomicBool,
    /// Nesting depth of write transactions
    transaction_depth: AtomicUsize,
    /// Primary write location captured after the last write
    last_write_location: Mutex<Option<WriteLocation>>,
}

/// Restores a flag to its previous value when dropped, so block forms
/// unwind correctly even when the future is cancelled
struct FlagGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a AtomicBool, value: bool) -> Self {
        let previous = flag.swap(value, Ordering::SeqCst);
        Self { flag, previous }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether queries must currently use the primary
    pub fn using_primary(&self) -> bool {
        self.use_primary.load(Ordering::SeqCst) || self.write_pinned.load(Ordering::SeqCst)
    }

    /// Pin this unit of work to the primary for the rest of its lifetime
    pub fn force_primary(&self) {
        self.use_primary.store(true, Ordering::SeqCst);
    }

    /// Run `f` pinned to the primary, then restore the previous pin.
    /// A write inside the block keeps the session pinned afterwards.
    pub async fn use_primary<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = FlagGuard::set(&self.use_primary, true);
        f().await
    }

    /// Record that a write happened. Pins the session to the primary unless
    /// inside an `ignore_writes` block. Idempotent.
    pub fn mark_write(&self) {
        self.performed_write.store(true, Ordering::SeqCst);
        if self.ignore_writes.load(Ordering::SeqCst) {
            return;
        }
        self.write_pinned.store(true, Ordering::SeqCst);
    }

    pub fn performed_write(&self) -> bool {
        self.performed_write.load(Ordering::SeqCst)
    }

    /// Run `f` without letting its writes pin the session to the primary
    pub async fn ignore_writes<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = FlagGuard::set(&self.ignore_writes, true);
        f().await
    }

    /// Run `f` with plain reads going to replicas even if the session is
    /// pinned. Writes and ambiguous operations still honour the pin.
    pub async fn use_replicas_for_read_queries<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = FlagGuard::set(&self.use_replicas_for_read_queries, true);
        f().await
    }

    pub fn uses_replicas_for_read_queries(&self) -> bool {
        self.use_replicas_for_read_queries.load(Ordering::SeqCst)
    }

    /// Run `f` with ambiguous operations and transactions sent to replicas.
    /// The caller guarantees they are read-only.
    pub async fn fallback_to_replicas_for_ambiguous_queries<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = FlagGuard::set(&self.fallback_to_replicas_for_ambiguous_queries, true);
        f().await
    }

    /// Ambiguous fallback only applies while the session is not using the primary
    pub fn falls_back_to_replicas_for_ambiguous_queries(&self) -> bool {
        self.fallback_to_replicas_for_ambiguous_queries
            .load(Ordering::SeqCst)
            && !self.using_primary()
            && !self.performed_write()
    }

    pub fn enter_transaction(&self) {
        self.transaction_depth.fetch_add(1, Ordering::SeqCst);
    }

    /// Leave a transaction; true when the outermost one just ended
    pub fn exit_transaction(&self) -> bool {
        let previous = self
            .transaction_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                Some(depth.saturating_sub(1))
            })
            .unwrap_or(0);
        previous == 1
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth.load(Ordering::SeqCst) > 0
    }

    pub fn last_write_location(&self) -> Option<WriteLocation> {
        self.location_slot().clone()
    }

    pub fn set_last_write_location(&self, location: Option<WriteLocation>) {
        *self.location_slot() = location;
    }

    /// The write location a write pin could be released against, if any.
    /// Explicit primary pins and open transactions are never released.
    pub fn releasable_write_location(&self) -> Option<WriteLocation> {
        if !self.write_pinned.load(Ordering::SeqCst)
            || self.use_primary.load(Ordering::SeqCst)
            || self.in_transaction()
        {
            return None;
        }
        self.last_write_location()
    }

    /// Drop the write pin if `location` is still the latest recorded write.
    /// Returns whether the pin was released.
    pub fn release_write_pin(&self, location: &WriteLocation) -> bool {
        let mut slot = self.location_slot();
        if slot.as_ref() != Some(location) {
            return false;
        }
        *slot = None;
        self.write_pinned.store(false, Ordering::SeqCst);
        true
    }

    fn location_slot(&self) -> std::sync::MutexGuard<'_, Option<WriteLocation>> {
        match self.last_write_location.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
