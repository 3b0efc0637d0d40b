//! The engine: a configured r2d2 pool of diesel connections.

use std::{fmt, marker::PhantomData, time::Duration};

use diesel::r2d2::{ConnectionManager, CustomizeConnection, Error as ManagerError, Pool, PooledConnection};
use tracing::{debug, info};

use crate::{
    config::DatabaseConfig,
    db::connection::{Backend, echo_statement},
    dialect::Dialect,
    error::DbError,
};

/// A connection checked out of an [`Engine`]'s pool.
pub type PooledConn<C> = PooledConnection<ConnectionManager<C>>;

/// Shared connection pool plus the settings it was built from.
///
/// Cloning is cheap; clones share the same pool.
pub struct Engine<C: Backend> {
    pool: Pool<ConnectionManager<C>>,
    checkout_timeout: Duration,
}

impl<C: Backend> Clone for Engine<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            checkout_timeout: self.checkout_timeout,
        }
    }
}

impl<C: Backend> fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.pool.state();
        f.debug_struct("Engine")
            .field("dialect", &C::DIALECT)
            .field("connections", &state.connections)
            .field("idle", &state.idle_connections)
            .field("checkout_timeout", &self.checkout_timeout)
            .finish()
    }
}

// Runs the backend's session setup and installs logging on new connections.
struct SessionSetup<C> {
    echo: bool,
    echo_pool: bool,
    _backend: PhantomData<fn() -> C>,
}

impl<C> fmt::Debug for SessionSetup<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSetup")
            .field("echo", &self.echo)
            .field("echo_pool", &self.echo_pool)
            .finish()
    }
}

impl<C: Backend> CustomizeConnection<C, ManagerError> for SessionSetup<C> {
    fn on_acquire(&self, conn: &mut C) -> Result<(), ManagerError> {
        conn.on_connect().map_err(ManagerError::QueryError)?;
        if self.echo {
            conn.set_instrumentation(echo_statement);
        }
        if self.echo_pool {
            info!(target: "scoped_db::pool", dialect = %C::DIALECT, "connection opened");
        }
        Ok(())
    }

    fn on_release(&self, _conn: C) {
        if self.echo_pool {
            info!(target: "scoped_db::pool", dialect = %C::DIALECT, "connection closed");
        }
    }
}

impl<C: Backend> Engine<C> {
    /// Builds the pool described by `config`.
    ///
    /// The URL must name `C`'s dialect. The pool opens its connections eagerly
    /// and fails if they cannot be established within the checkout timeout.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, DbError> {
        config
            .validate()
            .map_err(|e| DbError::Config(format!("{e:#}")))?;

        let configured = Dialect::from_url(&config.url)?;
        if configured != C::DIALECT {
            return Err(DbError::DialectMismatch {
                configured,
                backend: C::DIALECT,
            });
        }

        let checkout_timeout = config.checkout_timeout();
        let setup = SessionSetup::<C> {
            echo: config.echo,
            echo_pool: config.echo_pool,
            _backend: PhantomData,
        };
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .max_lifetime(config.max_lifetime())
            .connection_timeout(checkout_timeout)
            .connection_customizer(Box::new(setup))
            .build(ConnectionManager::<C>::new(config.url.as_str()))
            .map_err(DbError::Pool)?;

        info!(
            dialect = %C::DIALECT,
            pool_size = config.pool_size,
            recycle = ?config.max_lifetime(),
            "database engine ready"
        );
        Ok(Self {
            pool,
            checkout_timeout,
        })
    }

    /// Checks out a connection, waiting at most the configured timeout.
    pub fn checkout(&self) -> Result<PooledConn<C>, DbError> {
        self.checkout_within(self.checkout_timeout)
    }

    /// Checks out a connection, waiting at most `timeout`.
    ///
    /// Fails with [`DbError::PoolExhausted`] when the pool stays empty.
    pub fn checkout_within(&self, timeout: Duration) -> Result<PooledConn<C>, DbError> {
        let conn = self
            .pool
            .get_timeout(timeout)
            .map_err(|source| DbError::PoolExhausted { timeout, source })?;
        debug!(dialect = %C::DIALECT, checked_out = self.checked_out(), "connection checked out");
        Ok(conn)
    }

    /// Dialect of this engine's connections.
    pub fn dialect(&self) -> Dialect {
        C::DIALECT
    }

    /// Checkout timeout applied by [`Engine::checkout`].
    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    /// Number of connections currently checked out of the pool.
    pub fn checked_out(&self) -> u32 {
        let state = self.pool.state();
        state.connections - state.idle_connections
    }

    /// Number of idle connections waiting in the pool.
    pub fn idle(&self) -> u32 {
        self.pool.state().idle_connections
    }

    /// Maximum pool size.
    pub fn max_size(&self) -> u32 {
        self.pool.max_size()
    }

    /// The underlying r2d2 pool.
    pub fn pool(&self) -> &Pool<ConnectionManager<C>> {
        &self.pool
    }
}
