//! Context-scoped connections.
//!
//! [`ContextConnections`] binds at most one pooled connection to each live
//! context. The first [`connection_for`](ContextConnections::connection_for)
//! checks a connection out (and, unless disabled, begins a transaction); later
//! calls in the same context return the same connection. When the context
//! ends, the transaction is committed, or rolled back if the context failed,
//! and the connection goes back to the pool on every path.
//!
//! Per context the states are `NoConnection -> ConnectionOpen -> Closed`,
//! and `Closed` is terminal: ending a context twice is an error.
//!
//! Calls for one context must not race each other; calls for different
//! contexts may run concurrently.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use diesel::{
    QueryResult,
    connection::{Connection, TransactionManager},
};
use tracing::{debug, warn};

use crate::{
    context::{ContextHook, ContextId, ContextRegistry},
    db::{
        connection::Backend,
        engine::{Engine, PooledConn},
    },
    error::{DbError, TxAction},
};

type TxManager<C> = <C as Connection>::TransactionManager;

fn in_transaction<C: Backend>(conn: &mut C) -> QueryResult<bool> {
    let depth = <TxManager<C> as TransactionManager<C>>::transaction_manager_status_mut(conn).transaction_depth()?;
    Ok(depth.is_some())
}

/// Shared handle to the connection bound to one context.
///
/// Clones refer to the same connection. Once the context ends the connection
/// is released and [`ConnectionHandle::with`] fails with
/// [`DbError::ConnectionReleased`].
pub struct ConnectionHandle<C: Backend> {
    ctx: ContextId,
    slot: Arc<Mutex<Option<PooledConn<C>>>>,
}

impl<C: Backend> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C: Backend> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("ctx", &self.ctx)
            .field("released", &self.is_released())
            .finish()
    }
}

impl<C: Backend> ConnectionHandle<C> {
    fn new(ctx: ContextId, conn: PooledConn<C>) -> Self {
        Self {
            ctx,
            slot: Arc::new(Mutex::new(Some(conn))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PooledConn<C>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Option<PooledConn<C>> {
        self.lock().take()
    }

    /// The context this connection is bound to.
    pub fn context(&self) -> ContextId {
        self.ctx
    }

    /// Runs `f` with exclusive access to the connection.
    ///
    /// Do not call `with` on the same handle from inside `f`; the connection
    /// is locked for the duration of the call.
    pub fn with<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut C) -> Result<T, E>,
        E: From<DbError>,
    {
        let mut slot = self.lock();
        let conn = slot.as_mut().ok_or(DbError::ConnectionReleased(self.ctx))?;
        f(conn)
    }

    /// Whether the connection has gone back to the pool.
    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    /// Whether both handles refer to the same bound connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

struct ConnectionRecord<C: Backend> {
    handle: ConnectionHandle<C>,
    transaction: bool,
}

/// Lifecycle manager mapping live contexts to their connection records.
pub struct ContextConnections<C: Backend> {
    engine: Engine<C>,
    registry: Arc<ContextRegistry>,
    member: String,
    transaction_per_context: bool,
    records: Mutex<HashMap<ContextId, ConnectionRecord<C>>>,
    // ended here while the registry still had them live
    closed: Mutex<HashSet<ContextId>>,
}

impl<C: Backend> fmt::Debug for ContextConnections<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConnections")
            .field("member", &self.member)
            .field("transaction_per_context", &self.transaction_per_context)
            .field("open", &self.open_count())
            .finish()
    }
}

impl<C: Backend> ContextConnections<C> {
    /// Creates the manager and registers it with `registry` under `member`.
    ///
    /// The registry only keeps a weak reference; dropping the returned `Arc`
    /// detaches the manager.
    pub fn attach(
        engine: Engine<C>,
        registry: &Arc<ContextRegistry>,
        member: impl Into<String>,
        transaction_per_context: bool,
    ) -> Result<Arc<Self>, DbError> {
        let member = member.into();
        let manager = Arc::new(Self {
            engine,
            registry: Arc::clone(registry),
            member: member.clone(),
            transaction_per_context,
            records: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashSet::new()),
        });
        let hook: Weak<Self> = Arc::downgrade(&manager);
        registry.register(member, hook)?;
        Ok(manager)
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ContextId, ConnectionRecord<C>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed(&self) -> MutexGuard<'_, HashSet<ContextId>> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The engine connections are checked out from.
    pub fn engine(&self) -> &Engine<C> {
        &self.engine
    }

    /// Name this manager is registered under.
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Whether each context's connection is wrapped in a transaction.
    pub fn transaction_per_context(&self) -> bool {
        self.transaction_per_context
    }

    /// Number of contexts currently holding a connection.
    pub fn open_count(&self) -> usize {
        self.records().len()
    }

    /// Whether `ctx` currently holds a connection.
    pub fn has_connection(&self, ctx: ContextId) -> bool {
        self.records().contains_key(&ctx)
    }

    /// Returns the connection bound to `ctx`, binding a new one on first use.
    ///
    /// Fails with [`DbError::InvalidContext`] if `ctx` is not live and with
    /// [`DbError::PoolExhausted`] if no connection frees up in time.
    pub fn connection_for(&self, ctx: ContextId) -> Result<ConnectionHandle<C>, DbError> {
        if let Some(record) = self.records().get(&ctx) {
            return Ok(record.handle.clone());
        }
        if self.closed().contains(&ctx) || !self.registry.is_live(ctx) {
            return Err(DbError::InvalidContext(ctx));
        }

        // The map lock is not held while waiting on the pool.
        let mut conn = self.engine.checkout()?;
        let transaction = self.transaction_per_context;
        if transaction {
            <TxManager<C> as TransactionManager<C>>::begin_transaction(&mut *conn)?;
        }
        if let Err(e) = self.registry.activate(ctx, &self.member) {
            if transaction {
                if let Err(rb) = <TxManager<C> as TransactionManager<C>>::rollback_transaction(&mut *conn) {
                    warn!(%ctx, error = %rb, "rollback of orphaned transaction failed");
                }
            }
            return Err(e);
        }

        let handle = ConnectionHandle::new(ctx, conn);
        let mut records = self.records();
        let bound = records
            .entry(ctx)
            .or_insert_with(|| ConnectionRecord {
                handle: handle.clone(),
                transaction,
            })
            .handle
            .clone();
        debug!(%ctx, transaction, open = records.len(), "connection bound to context");
        Ok(bound)
    }

    /// Finishes `ctx`: commits (or rolls back when `failed`) and releases its connection.
    ///
    /// The connection is released even when commit or rollback fails; that
    /// failure is returned as [`DbError::TransactionEnd`]. Fails with
    /// [`DbError::UnknownContext`] if `ctx` holds no connection, including
    /// when it was already ended.
    ///
    /// Ending is final: if the registry still has `ctx` live, this manager
    /// refuses to bind it again and ignores the registry's later end event.
    pub fn on_context_end(&self, ctx: ContextId, failed: bool) -> Result<(), DbError> {
        let record = self.records().remove(&ctx).ok_or(DbError::UnknownContext(ctx))?;
        if self.registry.is_live(ctx) {
            self.closed().insert(ctx);
        }
        self.release(ctx, record, failed)
    }

    fn release(&self, ctx: ContextId, record: ConnectionRecord<C>, failed: bool) -> Result<(), DbError> {
        let mut conn = record.handle.take().ok_or(DbError::UnknownContext(ctx))?;

        let outcome = if record.transaction {
            finish_transaction(&mut *conn, ctx, failed)
        } else {
            Ok(())
        };

        drop(conn);
        debug!(%ctx, failed, ok = outcome.is_ok(), "connection released");
        outcome
    }
}

impl<C: Backend> ContextHook for ContextConnections<C> {
    fn on_context_end(&self, ctx: ContextId, failed: bool) -> Result<(), DbError> {
        if self.closed().remove(&ctx) {
            debug!(%ctx, "context already ended by its connection manager");
            return Ok(());
        }
        let record = self.records().remove(&ctx).ok_or(DbError::UnknownContext(ctx))?;
        self.release(ctx, record, failed)
    }
}

fn finish_transaction<C: Backend>(conn: &mut C, ctx: ContextId, failed: bool) -> Result<(), DbError> {
    let action = if failed { TxAction::Rollback } else { TxAction::Commit };

    match in_transaction(conn) {
        Ok(true) => {}
        Ok(false) => {
            warn!(%ctx, "per-context transaction was already finished by the application");
            return Ok(());
        }
        Err(source) => {
            return Err(DbError::TransactionEnd {
                ctx,
                action,
                source,
                cleanup: None,
            });
        }
    }

    let result = match action {
        TxAction::Commit => <TxManager<C> as TransactionManager<C>>::commit_transaction(conn),
        TxAction::Rollback => <TxManager<C> as TransactionManager<C>>::rollback_transaction(conn),
    };
    result.map_err(|source| DbError::TransactionEnd {
        ctx,
        action,
        source,
        cleanup: reset_connection(conn).err(),
    })
}

// Leave no open transaction behind before the connection goes back to the pool.
fn reset_connection<C: Backend>(conn: &mut C) -> QueryResult<()> {
    while in_transaction(conn)? {
        <TxManager<C> as TransactionManager<C>>::rollback_transaction(conn)?;
    }
    Ok(())
}
