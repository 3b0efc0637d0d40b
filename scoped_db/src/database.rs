//! The configured database: engine, safety flag, and optional per-context member.

use std::sync::Arc;

use tracing::info;

use crate::{
    config::DatabaseConfig,
    context::{ContextId, ContextRegistry},
    db::{connection::Backend, engine::Engine},
    destroy::{DestroyReport, SchemaDestroyer, destroy},
    error::DbError,
    lifecycle::{ConnectionHandle, ContextConnections},
};

/// One configured database.
///
/// Built by [`Database::init`] from a [`DatabaseConfig`]. When a context
/// registry is supplied and `ctx.member` is set, contexts get their own
/// connection through [`Database::connection`].
#[derive(Debug)]
pub struct Database<C: Backend> {
    engine: Engine<C>,
    destroyable: bool,
    contexts: Option<Arc<ContextConnections<C>>>,
}

impl<C: Backend> Database<C> {
    /// Builds the engine and, if configured, attaches the context member.
    pub fn init(config: &DatabaseConfig, registry: Option<&Arc<ContextRegistry>>) -> Result<Self, DbError> {
        let engine = Engine::<C>::from_config(config)?;
        let contexts = match (registry, config.ctx.member.as_deref()) {
            (Some(registry), Some(member)) => Some(ContextConnections::attach(
                engine.clone(),
                registry,
                member,
                config.ctx.transaction,
            )?),
            _ => None,
        };
        info!(
            dialect = %engine.dialect(),
            destroyable = config.destroyable,
            ctx_member = ?config.ctx.member.as_deref().filter(|_| contexts.is_some()),
            "database initialized"
        );
        Ok(Self {
            engine,
            destroyable: config.destroyable,
            contexts,
        })
    }

    /// The shared engine.
    pub fn engine(&self) -> &Engine<C> {
        &self.engine
    }

    /// Whether destructive operations are allowed.
    ///
    /// Application features that destroy data must consult this flag.
    pub fn destroyable(&self) -> bool {
        self.destroyable
    }

    /// The per-context connection manager, if one is attached.
    pub fn contexts(&self) -> Option<&Arc<ContextConnections<C>>> {
        self.contexts.as_ref()
    }

    /// The connection bound to `ctx`; see [`ContextConnections::connection_for`].
    pub fn connection(&self, ctx: ContextId) -> Result<ConnectionHandle<C>, DbError> {
        let contexts = self.contexts.as_ref().ok_or_else(|| {
            DbError::Config("no context member is configured for this database".into())
        })?;
        contexts.connection_for(ctx)
    }
}

impl<C: Backend + SchemaDestroyer> Database<C> {
    /// Drops everything in the database.
    ///
    /// Uses `conn` if given, otherwise a connection from the pool. Fails with
    /// [`DbError::NotDestroyable`] unless the database was configured as
    /// destroyable.
    pub fn destroy(&self, conn: Option<&mut C>) -> Result<DestroyReport, DbError> {
        if !self.destroyable {
            return Err(DbError::NotDestroyable);
        }
        match conn {
            Some(conn) => destroy(conn, self.destroyable),
            None => destroy(&mut *self.engine.checkout()?, self.destroyable),
        }
    }
}
