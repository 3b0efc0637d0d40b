//! Error type shared by every module in this crate.

use std::{fmt, time::Duration};

use diesel::{ConnectionError, r2d2::PoolError, result::Error as QueryError};
use thiserror::Error;

use crate::{context::ContextId, dialect::Dialect};

/// Which way a per-context transaction was being finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// The context ended normally.
    Commit,
    /// The context ended with a failure.
    Rollback,
}

impl fmt::Display for TxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxAction::Commit => f.write_str("commit"),
            TxAction::Rollback => f.write_str("roll back"),
        }
    }
}

/// Errors surfaced by the engine, the context lifecycle, and the schema destroyer.
#[derive(Debug, Error)]
pub enum DbError {
    /// A connection was requested for a context the registry does not know as live.
    #[error("{0} is not a live context")]
    InvalidContext(ContextId),

    /// End-of-life was signalled for a context without an open connection record.
    #[error("no connection is bound to {0}; was the context already closed?")]
    UnknownContext(ContextId),

    /// A handle was used after its context ended and the connection went back to the pool.
    #[error("the connection bound to {0} has already been released")]
    ConnectionReleased(ContextId),

    /// A destructive operation was attempted without the `destroyable` flag.
    #[error("database is not configured as destroyable")]
    NotDestroyable,

    /// No pooled connection became available within the checkout timeout.
    #[error("no connection available after {timeout:?}")]
    PoolExhausted {
        /// The timeout that elapsed.
        timeout: Duration,
        /// Error reported by the pool.
        #[source]
        source: PoolError,
    },

    /// The URL names a dialect this crate cannot operate on.
    #[error("unsupported database dialect: {0}")]
    UnsupportedDialect(String),

    /// The configured URL does not match the connection type the engine was built for.
    #[error("configured url is {configured}, but the engine backend is {backend}")]
    DialectMismatch {
        /// Dialect derived from the configured URL.
        configured: Dialect,
        /// Dialect of the connection type.
        backend: Dialect,
    },

    /// Invalid configuration values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pool could not be built.
    #[error("failed to build connection pool")]
    Pool(#[source] PoolError),

    /// A standalone connection could not be established.
    #[error("failed to connect")]
    Connect(#[from] ConnectionError),

    /// A statement failed.
    #[error("query failed: {0}")]
    Query(#[from] QueryError),

    /// Committing or rolling back a per-context transaction failed.
    ///
    /// `source` is the original failure; `cleanup` is set when resetting the
    /// connection before its release failed too.
    #[error("failed to {action} the transaction of {ctx}: {source}{}", cleanup_note(.cleanup))]
    TransactionEnd {
        /// Context whose transaction was being finished.
        ctx: ContextId,
        /// Whether a commit or a rollback was attempted.
        action: TxAction,
        /// The commit/rollback error.
        #[source]
        source: QueryError,
        /// Secondary failure while resetting the connection.
        cleanup: Option<QueryError>,
    },
}

fn cleanup_note(cleanup: &Option<QueryError>) -> String {
    match cleanup {
        Some(e) => format!(" (connection reset also failed: {e})"),
        None => String::new(),
    }
}

/// Result alias used across the crate.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_end_mentions_cleanup_failure() {
        let err = DbError::TransactionEnd {
            ctx: ContextId::from_raw(7),
            action: TxAction::Commit,
            source: QueryError::NotInTransaction,
            cleanup: Some(QueryError::BrokenTransactionManager),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed to commit the transaction of ctx-7"));
        assert!(msg.contains("connection reset also failed"));
    }

    #[test]
    fn transaction_end_without_cleanup_is_plain() {
        let err = DbError::TransactionEnd {
            ctx: ContextId::from_raw(3),
            action: TxAction::Rollback,
            source: QueryError::NotInTransaction,
            cleanup: None,
        };
        assert!(!err.to_string().contains("reset"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
