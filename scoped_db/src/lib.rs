//! Context-scoped database connections and schema tooling on top of diesel.
//!
//! - [`config`]: TOML / flat-settings / environment configuration
//! - [`db`]: per-backend connection setup and the pooled [`Engine`]
//! - [`context`]: the registry issuing context identities and end events
//! - [`lifecycle`]: one connection (and transaction) per live context
//! - [`destroy`]: drop every object in a PostgreSQL or SQLite database
//! - [`database`]: all of the above wired together from one config
//!
//! ```no_run
//! use std::sync::Arc;
//! use diesel::{SqliteConnection, connection::SimpleConnection};
//! use scoped_db::{ContextRegistry, Database, DatabaseConfig, DbError};
//!
//! let registry = Arc::new(ContextRegistry::new());
//! let db = Database::<SqliteConnection>::init(&DatabaseConfig::new("app.db"), Some(&registry))?;
//!
//! registry.run(|ctx| {
//!     let conn = db.connection(ctx)?;
//!     conn.with(|c| c.batch_execute("INSERT INTO hits DEFAULT VALUES").map_err(DbError::from))
//! })?;
//! # Ok::<(), DbError>(())
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod database;
pub mod db;
pub mod destroy;
pub mod dialect;
pub mod error;
pub mod lifecycle;

pub use config::DatabaseConfig;
pub use context::{ContextId, ContextRegistry, ContextScope};
pub use database::Database;
pub use db::{connection::Backend, engine::Engine};
pub use destroy::{DestroyReport, ObjectKind, SchemaDestroyer, destroy, destroy_url};
pub use dialect::Dialect;
pub use error::{DbError, DbResult};
pub use lifecycle::{ConnectionHandle, ContextConnections};
