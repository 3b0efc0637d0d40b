//! SQL dialect detection from connection URLs.

use std::fmt;

use crate::error::DbError;

/// The database dialects this crate can pool and destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL (`postgres://` or `postgresql://`).
    Postgres,
    /// SQLite (`sqlite://`, `file:`, `:memory:` or a bare file path).
    Sqlite,
}

impl Dialect {
    /// Resolves the dialect named by a database URL.
    ///
    /// Anything with a URL scheme other than the PostgreSQL and SQLite ones is
    /// rejected with [`DbError::UnsupportedDialect`]. Strings without a scheme
    /// are taken to be SQLite file paths.
    pub fn from_url(url: &str) -> Result<Self, DbError> {
        let url = url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Dialect::Postgres);
        }
        if url.starts_with("sqlite://") || url.starts_with("file:") || url == ":memory:" {
            return Ok(Dialect::Sqlite);
        }
        // diesel only rewrites `sqlite://`; anything else would become a file name
        if url.starts_with("sqlite:") {
            return Err(DbError::Config(format!("sqlite urls must start with sqlite://, got {url:?}")));
        }
        match url.split_once("://") {
            Some((scheme, _)) => Err(DbError::UnsupportedDialect(scheme.to_string())),
            None if url.is_empty() => Err(DbError::Config("database url is empty".into())),
            None => Ok(Dialect::Sqlite),
        }
    }

    /// Lowercase name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
