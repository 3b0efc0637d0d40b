//! Schema destruction: drop every user-created object in a database.
//!
//! Meant for test and throwaway databases only. Every entry point refuses to
//! run unless the caller passes the configured `destroyable` flag, and the
//! check happens before any statement is executed.
//!
//! The algorithm is shared; dialects plug in through [`SchemaDestroyer`]:
//!
//! 1. [`prepare`](SchemaDestroyer::prepare) (SQLite: foreign keys off)
//! 2. in one transaction, for each kind in [`drop_order`](SchemaDestroyer::drop_order):
//!    enumerate with [`list_droppable_objects`](SchemaDestroyer::list_droppable_objects),
//!    then run [`drop_statement`](SchemaDestroyer::drop_statement) for each
//! 3. [`compact`](SchemaDestroyer::compact) after commit (SQLite: `VACUUM`)
//! 4. [`restore`](SchemaDestroyer::restore), on success and failure alike
//!    (SQLite: foreign keys back on)
//!
//! Ordering plus cascading drops stand in for a real dependency graph. Drops
//! use `IF EXISTS` so objects already removed by an earlier cascade are
//! skipped. Not safe to run concurrently with other schema changes on the
//! same database.

mod postgres;
mod sqlite;

use std::fmt;

use diesel::{Connection, PgConnection, QueryResult, SqliteConnection};
use tracing::{debug, info, warn};

use crate::{db::connection::connect, dialect::Dialect, error::DbError};

/// Kinds of schema objects the destroyer knows how to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// A standalone sequence (PostgreSQL).
    Sequence,
    /// A view.
    View,
    /// An enum type (PostgreSQL).
    EnumType,
    /// A base table.
    Table,
    /// A trigger (SQLite).
    Trigger,
}

impl ObjectKind {
    /// SQL keyword following `DROP`.
    pub fn keyword(self) -> &'static str {
        match self {
            ObjectKind::Sequence => "SEQUENCE",
            ObjectKind::View => "VIEW",
            ObjectKind::EnumType => "TYPE",
            ObjectKind::Table => "TABLE",
            ObjectKind::Trigger => "TRIGGER",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Sequence => "sequence",
            ObjectKind::View => "view",
            ObjectKind::EnumType => "enum type",
            ObjectKind::Table => "table",
            ObjectKind::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

/// Dialect capability used by [`destroy`].
pub trait SchemaDestroyer: Connection {
    /// Object kinds in the order they are dropped; dependents come first.
    fn drop_order() -> &'static [ObjectKind];

    /// Names of the existing objects of `kind`.
    fn list_droppable_objects(&mut self, kind: ObjectKind) -> QueryResult<Vec<String>>;

    /// The statement dropping object `name` of `kind`.
    fn drop_statement(kind: ObjectKind, name: &str) -> String;

    /// Runs before the drop transaction starts.
    fn prepare(&mut self) -> QueryResult<()> {
        Ok(())
    }

    /// Runs after the drop transaction committed.
    fn compact(&mut self) -> QueryResult<()> {
        Ok(())
    }

    /// Runs last, whether or not the drops succeeded.
    fn restore(&mut self) -> QueryResult<()> {
        Ok(())
    }
}

/// Objects removed by one [`destroy`] run, in drop order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    /// `(kind, name)` for every executed drop.
    pub dropped: Vec<(ObjectKind, String)>,
}

impl DestroyReport {
    /// Number of dropped objects of `kind`.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.dropped.iter().filter(|(k, _)| *k == kind).count()
    }

    /// Total number of dropped objects.
    pub fn total(&self) -> usize {
        self.dropped.len()
    }

    /// Whether nothing was dropped.
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Drops everything in the database behind `conn`.
///
/// Fails with [`DbError::NotDestroyable`] unless `destroyable` is true. The
/// drops run in one transaction (a savepoint if `conn` is already in one), so
/// a failure leaves the schema as it was.
pub fn destroy<C: SchemaDestroyer>(conn: &mut C, destroyable: bool) -> Result<DestroyReport, DbError> {
    if !destroyable {
        return Err(DbError::NotDestroyable);
    }

    conn.prepare()?;
    let outcome = conn
        .transaction::<_, DbError, _>(|conn| {
            let mut report = DestroyReport::default();
            for &kind in C::drop_order() {
                for name in conn.list_droppable_objects(kind)? {
                    let sql = C::drop_statement(kind, &name);
                    debug!(%kind, %name, "dropping");
                    conn.batch_execute(&sql)?;
                    report.dropped.push((kind, name));
                }
            }
            Ok(report)
        })
        .and_then(|report| {
            conn.compact()?;
            Ok(report)
        });

    let restored = conn.restore();
    match (outcome, restored) {
        (Ok(report), Ok(())) => {
            info!(dropped = report.total(), "database destroyed");
            Ok(report)
        }
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), restored) => {
            if let Err(re) = restored {
                warn!(error = %re, "failed to restore connection settings after aborted destroy");
            }
            Err(e)
        }
    }
}

/// Connects to `url` and destroys its schema, picking the dialect at runtime.
///
/// The `destroyable` check comes first; then any URL other than PostgreSQL
/// or SQLite fails with [`DbError::UnsupportedDialect`].
pub fn destroy_url(url: &str, destroyable: bool) -> Result<DestroyReport, DbError> {
    if !destroyable {
        return Err(DbError::NotDestroyable);
    }
    match Dialect::from_url(url)? {
        Dialect::Postgres => destroy(&mut connect::<PgConnection>(url)?, true),
        Dialect::Sqlite => destroy(&mut connect::<SqliteConnection>(url)?, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn report_counts_by_kind() {
        let report = DestroyReport {
            dropped: vec![
                (ObjectKind::View, "v".into()),
                (ObjectKind::Table, "a".into()),
                (ObjectKind::Table, "b".into()),
            ],
        };
        assert_eq!(report.count(ObjectKind::Table), 2);
        assert_eq!(report.count(ObjectKind::Sequence), 0);
        assert_eq!(report.total(), 3);
    }

    #[test]
    fn refuses_without_flag_before_connecting() {
        // the url is never opened
        assert!(matches!(
            destroy_url("/nonexistent/dir/db.sqlite", false),
            Err(DbError::NotDestroyable)
        ));
        assert!(matches!(
            destroy_url("mysql://root@localhost/app", false),
            Err(DbError::NotDestroyable)
        ));
    }

    #[test]
    fn unsupported_dialect_is_reported() {
        assert!(matches!(
            destroy_url("mysql://root@localhost/app", true),
            Err(DbError::UnsupportedDialect(s)) if s == "mysql"
        ));
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    proptest! {
        #[test]
        fn quoted_identifiers_are_balanced(name in ".{0,24}") {
            let q = quote_ident(&name);
            prop_assert!(q.starts_with('"') && q.ends_with('"'));
            let inner = &q[1..q.len() - 1];
            prop_assert_eq!(inner.replace("\"\"", "\""), name.clone());
            prop_assert_eq!(inner.matches('"').count() % 2, 0);
        }
    }
}
