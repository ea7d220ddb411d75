//! Request Scope
//!
//! Everything the balancer remembers for one unit of work: its session, the
//! replica it reads from and whether it is inside a read-only transaction.
//! Scopes are cheap to clone; clones share state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::host::Host;
use crate::session::Session;

pub struct RequestScope<D> {
    inner: Arc<ScopeInner<D>>,
}

struct ScopeInner<D> {
    id: Uuid,
    session: Session,
    /// Replica used for reads in this unit of work
    host: Mutex<Option<Arc<Host<D>>>>,
    read_only_transaction: AtomicBool,
}

impl<D> RequestScope<D> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: Uuid::new_v4(),
                session: Session::new(),
                host: Mutex::new(None),
                read_only_transaction: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier used in log output
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn in_read_only_transaction(&self) -> bool {
        self.inner.read_only_transaction.load(Ordering::SeqCst)
    }

    /// Mark a read-only transaction as open; returns the previous flag
    pub(crate) fn set_read_only_transaction(&self, open: bool) -> bool {
        self.inner.read_only_transaction.swap(open, Ordering::SeqCst)
    }

    pub(crate) fn cached_host(&self) -> Option<Arc<Host<D>>> {
        self.host_slot().clone()
    }

    pub(crate) fn cache_host(&self, host: Arc<Host<D>>) {
        *self.host_slot() = Some(host);
    }

    pub(crate) fn take_host(&self) -> Option<Arc<Host<D>>> {
        self.host_slot().take()
    }

    fn host_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Host<D>>>> {
        match self.inner.host.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<D> Clone for RequestScope<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> Default for RequestScope<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> std::fmt::Debug for RequestScope<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session)
            .finish()
    }
}
