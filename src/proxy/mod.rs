//! Connection Proxy Module
//!
//! Single dispatch point between the query layer and the load balancer.
//! Each call is classified, then sent to a replica or the primary while
//! the request's session records writes and transaction nesting.

mod operation;

use std::future::Future;
use std::sync::Arc;

use crate::balancer::{LoadBalancer, RequestScope};
use crate::database::{Database, DbRole};
use crate::error::{Error, Result};
use crate::session::Session;

pub use operation::{Operation, NON_STICKY_READS, STICKY_WRITES};

/// Routes queries for many units of work through one load balancer
pub struct ConnectionProxy<D> {
    load_balancer: Arc<LoadBalancer<D>>,
}

impl<D> Clone for ConnectionProxy<D> {
    fn clone(&self) -> Self {
        Self {
            load_balancer: Arc::clone(&self.load_balancer),
        }
    }
}

/// Leaves a write transaction level, also when the future is dropped
struct TransactionLevel<'a> {
    session: &'a Session,
    open: bool,
}

impl<'a> TransactionLevel<'a> {
    fn enter(session: &'a Session) -> Self {
        session.enter_transaction();
        Self { session, open: true }
    }

    /// True when the outermost transaction ended
    fn exit(mut self) -> bool {
        self.open = false;
        self.session.exit_transaction()
    }
}

impl Drop for TransactionLevel<'_> {
    fn drop(&mut self) {
        if self.open {
            self.session.exit_transaction();
        }
    }
}

/// Restores the read-only transaction flag of a scope
struct ReadOnlyTransaction<'a, D> {
    scope: &'a RequestScope<D>,
    previous: bool,
}

impl<'a, D> ReadOnlyTransaction<'a, D> {
    fn open(scope: &'a RequestScope<D>) -> Self {
        let previous = scope.set_read_only_transaction(true);
        Self { scope, previous }
    }
}

impl<D> Drop for ReadOnlyTransaction<'_, D> {
    fn drop(&mut self) {
        self.scope.set_read_only_transaction(self.previous);
    }
}

impl<D: Database> ConnectionProxy<D> {
    pub fn new(load_balancer: Arc<LoadBalancer<D>>) -> Self {
        Self { load_balancer }
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer<D>> {
        &self.load_balancer
    }

    /// Run a named call, e.g. `"select"` or `"insert"`
    pub async fn call<F, Fut, T>(&self, scope: &RequestScope<D>, method: &str, f: F) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.dispatch(scope, Operation::for_method(method), f).await
    }

    /// Run a raw SQL statement
    pub async fn execute<F, Fut, T>(&self, scope: &RequestScope<D>, sql: &str, f: F) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.dispatch(scope, Operation::for_sql(sql), f).await
    }

    pub async fn dispatch<F, Fut, T>(
        &self,
        scope: &RequestScope<D>,
        operation: Operation,
        f: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match operation {
            Operation::Read => self.read_using_load_balancer(scope, f).await,
            Operation::Write => self.write_using_load_balancer(scope, f, true).await,
            Operation::Transaction => self.transaction(scope, f).await,
            Operation::Unknown => {
                if scope.session().falls_back_to_replicas_for_ambiguous_queries() {
                    self.read_using_load_balancer(scope, f).await
                } else {
                    self.write_using_load_balancer(scope, f, false).await
                }
            }
        }
    }

    /// Send a read to a replica unless the unit of work needs the primary.
    /// A write pin is released once every replica replayed the write.
    pub async fn read_using_load_balancer<F, Fut, T>(&self, scope: &RequestScope<D>, f: F) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = scope.session();

        if session.in_transaction() {
            return self.load_balancer.read_write(f).await;
        }

        if session.uses_replicas_for_read_queries() {
            return self.load_balancer.read(scope, f).await;
        }

        if session.using_primary() {
            if let Some(location) = session.releasable_write_location() {
                if self.load_balancer.all_caught_up(&location).await
                    && session.release_write_pin(&location)
                {
                    tracing::debug!(
                        request_id = %scope.id(),
                        "Replicas caught up to {}, reading from replicas again",
                        location
                    );
                    return self.load_balancer.read(scope, f).await;
                }
            }
            return self.load_balancer.read_write(f).await;
        }

        self.load_balancer.read(scope, f).await
    }

    /// Send a call to the primary. Sticky calls pin the session and, outside
    /// a transaction, record the primary's write location afterwards.
    pub async fn write_using_load_balancer<F, Fut, T>(
        &self,
        scope: &RequestScope<D>,
        f: F,
        sticky: bool,
    ) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if scope.in_read_only_transaction() {
            return Err(Error::WriteInsideReadOnlyTransaction);
        }

        if sticky {
            scope.session().mark_write();
        }

        let value = match self.load_balancer.read_write(f).await {
            Ok(value) => value,
            Err(e) => {
                // The write may have committed; an older location must not
                // release the pin
                if sticky {
                    scope.session().set_last_write_location(None);
                }
                return Err(e);
            }
        };

        if sticky && !scope.session().in_transaction() {
            self.record_write_location(scope).await;
        }

        Ok(value)
    }

    /// Run a transaction block. Inside an ambiguous-queries fallback it is a
    /// read-only transaction on a replica; otherwise it runs on the primary
    /// and the write location is captured once the outermost level ends.
    pub async fn transaction<F, Fut, T>(&self, scope: &RequestScope<D>, f: F) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = scope.session();

        if session.falls_back_to_replicas_for_ambiguous_queries() {
            let _read_only = ReadOnlyTransaction::open(scope);
            return self.load_balancer.read(scope, f).await;
        }

        if scope.in_read_only_transaction() {
            return Err(Error::WriteInsideReadOnlyTransaction);
        }

        session.mark_write();
        let level = TransactionLevel::enter(session);
        let result = self.load_balancer.read_write(f).await;
        let outermost = level.exit();

        if outermost {
            if result.is_ok() {
                self.record_write_location(scope).await;
            } else {
                session.set_last_write_location(None);
            }
        }

        result
    }

    pub fn db_role_for(&self, database: &Arc<D>) -> Option<DbRole> {
        self.load_balancer.db_role_for(database)
    }

    /// Remember the primary's position so a later read can tell when the
    /// replicas have the write
    async fn record_write_location(&self, scope: &RequestScope<D>) {
        match self.load_balancer.primary_write_location().await {
            Ok(location) => scope.session().set_last_write_location(Some(location)),
            Err(e) => {
                tracing::warn!(
                    request_id = %scope.id(),
                    "Could not record primary write location: {}",
                    e
                );
                scope.session().set_last_write_location(None);
            }
        }
    }
}
