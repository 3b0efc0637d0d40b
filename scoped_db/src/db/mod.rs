//! Database engine utilities: per-backend connection setup and pooling.
//!
//! This module provides:
//! - [`connection::Backend`]: the diesel connection types this crate supports
//!   (`PgConnection`, `SqliteConnection`) and their session setup;
//!   [`connection::connect`] opens a standalone connection.
//! - [`engine::Engine`]: an r2d2 pool built from a
//!   [`DatabaseConfig`](crate::config::DatabaseConfig), with bounded checkout.
//!
//! Example:
//! ```no_run
//! use diesel::SqliteConnection;
//! use scoped_db::{config::DatabaseConfig, db::engine::Engine};
//!
//! let db_path = std::env::temp_dir().join("scoped_db_engine.db");
//! let cfg = DatabaseConfig::new(db_path.to_string_lossy());
//! let engine = Engine::<SqliteConnection>::from_config(&cfg).expect("engine");
//! let _conn = engine.checkout().expect("connection");
//! ```
//!
//! Note: Building with PostgreSQL support requires the system libpq (e.g., libpq-dev on Debian/Ubuntu).

pub mod connection;
pub mod engine;
