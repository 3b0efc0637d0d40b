//! Per-backend connection setup.
//!
//! [`Backend`] ties a diesel connection type to its [`Dialect`] and to the
//! session setup applied whenever a physical connection is opened. SQLite
//! connections get the recommended PRAGMAs for local development: WAL
//! journaling, foreign_keys=ON, and a 5000ms busy_timeout.
//!
//! Example:
//! ```no_run
//! use scoped_db::db::connection::connect;
//! use diesel::SqliteConnection;
//!
//! let path = std::env::temp_dir().join("scoped_db_example.db");
//! let _conn: SqliteConnection = connect(path.to_str().unwrap()).expect("open sqlite");
//! ```

use diesel::{
    Connection, PgConnection, QueryResult, SqliteConnection,
    connection::{InstrumentationEvent, SimpleConnection},
    r2d2::R2D2Connection,
};

use crate::{dialect::Dialect, error::DbError};

/// A diesel connection type this crate can pool.
pub trait Backend: Connection + R2D2Connection + Send + 'static {
    /// Dialect spoken by this connection type.
    const DIALECT: Dialect;

    /// Session setup run once on every newly opened connection.
    fn on_connect(&mut self) -> QueryResult<()> {
        Ok(())
    }
}

impl Backend for PgConnection {
    const DIALECT: Dialect = Dialect::Postgres;
}

impl Backend for SqliteConnection {
    const DIALECT: Dialect = Dialect::Sqlite;

    fn on_connect(&mut self) -> QueryResult<()> {
        // busy_timeout first: pooled connections open concurrently
        self.batch_execute("PRAGMA busy_timeout=5000;")?;
        self.batch_execute("PRAGMA journal_mode=WAL;")?;
        self.batch_execute("PRAGMA foreign_keys=ON;")
    }
}

/// Open a standalone (unpooled) connection and apply the backend's session setup.
///
/// Fails with [`DbError::DialectMismatch`] if `database_url` names another dialect.
pub fn connect<C: Backend>(database_url: &str) -> Result<C, DbError> {
    let configured = Dialect::from_url(database_url)?;
    if configured != C::DIALECT {
        return Err(DbError::DialectMismatch {
            configured,
            backend: C::DIALECT,
        });
    }
    let mut conn = C::establish(database_url)?;
    conn.on_connect()?;
    Ok(conn)
}

/// Statement logger installed on connections when `echo` is enabled.
pub(crate) fn echo_statement(event: InstrumentationEvent<'_>) {
    if let InstrumentationEvent::StartQuery { query, .. } = event {
        tracing::info!(target: "scoped_db::echo", "{query}");
    }
}
