//! Context registry: identities and end-of-life notifications for units of work.
//!
//! A context is one logical unit of work, typically a request. The registry
//! hands out opaque [`ContextId`] tokens, remembers which *members* (named
//! resources such as the per-context database connection) were activated in
//! each context, and notifies those members when the context ends.
//!
//! Members are registered as [`ContextHook`]s behind a `Weak` pointer, so the
//! registry never keeps a member alive on its own.
//!
//! ```
//! use std::sync::Arc;
//! use scoped_db::context::ContextRegistry;
//!
//! let registry = Arc::new(ContextRegistry::new());
//! let answer = registry
//!     .run(|ctx| -> Result<u32, scoped_db::DbError> {
//!         assert!(registry.is_live(ctx));
//!         Ok(42)
//!     })
//!     .unwrap();
//! assert_eq!(answer, 42);
//! assert_eq!(registry.live_count(), 0);
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, error, warn};

use crate::error::DbError;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one context. Unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ContextId(raw)
    }

    /// The raw token value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A member that wants to hear about the end of contexts it was activated in.
pub trait ContextHook: Send + Sync {
    /// Called once when a context in which this member was activated ends.
    fn on_context_end(&self, ctx: ContextId, failed: bool) -> Result<(), DbError>;
}

/// Tracks live contexts and dispatches end-of-life events to members.
#[derive(Default)]
pub struct ContextRegistry {
    // live context -> activated member names, in activation order
    live: Mutex<HashMap<ContextId, Vec<String>>>,
    hooks: RwLock<Vec<(String, Weak<dyn ContextHook>)>>,
}

impl ContextRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<ContextId, Vec<String>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the hook for member `name`. Names are unique among live members.
    pub fn register(&self, name: impl Into<String>, hook: Weak<dyn ContextHook>) -> Result<(), DbError> {
        let name = name.into();
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        // names of dropped members are free again
        hooks.retain(|(_, h)| h.strong_count() > 0);
        if hooks.iter().any(|(n, _)| *n == name) {
            return Err(DbError::Config(format!("context member {name:?} is already registered")));
        }
        hooks.push((name, hook));
        Ok(())
    }

    /// Starts a new context.
    pub fn begin(&self) -> ContextId {
        let ctx = ContextId::next();
        self.live().insert(ctx, Vec::new());
        debug!(%ctx, "context started");
        ctx
    }

    /// Starts a new context bound to a guard that ends it on drop.
    pub fn scope(self: &Arc<Self>) -> ContextScope {
        ContextScope {
            registry: Arc::clone(self),
            ctx: self.begin(),
            finished: false,
        }
    }

    /// Whether `ctx` has been started and not yet ended.
    pub fn is_live(&self, ctx: ContextId) -> bool {
        self.live().contains_key(&ctx)
    }

    /// Number of live contexts.
    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    /// Records that member `name` holds a resource in `ctx`.
    ///
    /// Fails with [`DbError::InvalidContext`] if `ctx` is not live.
    pub fn activate(&self, ctx: ContextId, name: &str) -> Result<(), DbError> {
        let mut live = self.live();
        let members = live.get_mut(&ctx).ok_or(DbError::InvalidContext(ctx))?;
        if !members.iter().any(|m| m == name) {
            members.push(name.to_string());
        }
        Ok(())
    }

    /// Ends `ctx`, notifying activated members in reverse activation order.
    ///
    /// Every member is notified even if an earlier one fails; the first
    /// failure is returned and later ones are logged.
    pub fn end(&self, ctx: ContextId, failed: bool) -> Result<(), DbError> {
        let members = self.live().remove(&ctx).ok_or(DbError::InvalidContext(ctx))?;
        debug!(%ctx, failed, members = members.len(), "context ending");

        let hooks: Vec<(String, Arc<dyn ContextHook>)> = {
            let registered = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
            members
                .iter()
                .rev()
                .filter_map(|name| {
                    let hook = registered.iter().find(|(n, _)| n == name).and_then(|(_, h)| h.upgrade());
                    if hook.is_none() {
                        warn!(%ctx, member = %name, "context member is gone; skipping end hook");
                    }
                    hook.map(|h| (name.clone(), h))
                })
                .collect()
        };

        let mut first_err = None;
        for (name, hook) in hooks {
            if let Err(e) = hook.on_context_end(ctx, failed) {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    error!(%ctx, member = %name, error = %e, "context member failed to close");
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Runs `f` inside a fresh context and ends it with `failed` set from the result.
    ///
    /// When `f` succeeds but ending the context fails, that error is returned.
    /// When `f` fails, its error wins and an end failure is only logged.
    pub fn run<T, E, F>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(ContextId) -> Result<T, E>,
        E: From<DbError>,
    {
        let scope = self.scope();
        let ctx = scope.id();
        match f(ctx) {
            Ok(value) => {
                scope.finish(false)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(end_err) = scope.finish(true) {
                    error!(%ctx, error = %end_err, "failed to end context after error");
                }
                Err(e)
            }
        }
    }
}

/// Guard for one context. Ending it explicitly with [`ContextScope::finish`]
/// reports the outcome; dropping it unfinished ends the context as failed.
pub struct ContextScope {
    registry: Arc<ContextRegistry>,
    ctx: ContextId,
    finished: bool,
}

impl ContextScope {
    /// The context this guard owns.
    pub fn id(&self) -> ContextId {
        self.ctx
    }

    /// Ends the context, reporting whether it failed.
    pub fn finish(mut self, failed: bool) -> Result<(), DbError> {
        self.finished = true;
        self.registry.end(self.ctx, failed)
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.registry.end(self.ctx, true) {
            error!(ctx = %self.ctx, error = %e, "failed to end abandoned context");
        }
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("ctx", &self.ctx)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ContextId, bool)>>,
        fail: bool,
    }

    impl ContextHook for Recorder {
        fn on_context_end(&self, ctx: ContextId, failed: bool) -> Result<(), DbError> {
            self.calls.lock().unwrap().push((ctx, failed));
            if self.fail {
                Err(DbError::UnknownContext(ctx))
            } else {
                Ok(())
            }
        }
    }

    fn hook(r: &Arc<Recorder>) -> Weak<dyn ContextHook> {
        let weak: Weak<Recorder> = Arc::downgrade(r);
        weak
    }

    #[test]
    fn ids_are_unique_and_displayable() {
        let reg = ContextRegistry::new();
        let a = reg.begin();
        let b = reg.begin();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("ctx-{}", a.as_u64()));
    }

    #[test]
    fn only_activated_members_are_notified() {
        let reg = ContextRegistry::new();
        let rec = Arc::new(Recorder::default());
        reg.register("db", hook(&rec)).unwrap();

        let quiet = reg.begin();
        reg.end(quiet, false).unwrap();
        assert!(rec.calls.lock().unwrap().is_empty());

        let busy = reg.begin();
        reg.activate(busy, "db").unwrap();
        reg.activate(busy, "db").unwrap();
        reg.end(busy, true).unwrap();
        assert_eq!(*rec.calls.lock().unwrap(), vec![(busy, true)]);
    }

    #[test]
    fn ended_contexts_are_not_live() {
        let reg = ContextRegistry::new();
        let ctx = reg.begin();
        reg.end(ctx, false).unwrap();
        assert!(!reg.is_live(ctx));
        assert!(matches!(reg.activate(ctx, "db"), Err(DbError::InvalidContext(c)) if c == ctx));
        assert!(matches!(reg.end(ctx, false), Err(DbError::InvalidContext(_))));
    }

    #[test]
    fn duplicate_member_names_are_rejected() {
        let reg = ContextRegistry::new();
        let rec = Arc::new(Recorder::default());
        reg.register("db", hook(&rec)).unwrap();
        assert!(matches!(reg.register("db", hook(&rec)), Err(DbError::Config(_))));
    }

    #[test]
    fn dropped_member_frees_its_name() {
        let reg = ContextRegistry::new();
        let first = Arc::new(Recorder::default());
        reg.register("db", hook(&first)).unwrap();
        drop(first);

        let second = Arc::new(Recorder::default());
        reg.register("db", hook(&second)).unwrap();
        let ctx = reg.begin();
        reg.activate(ctx, "db").unwrap();
        reg.end(ctx, false).unwrap();
        assert_eq!(*second.calls.lock().unwrap(), vec![(ctx, false)]);
        assert_eq!(reg.hooks.read().unwrap().len(), 1);
    }

    #[test]
    fn hook_errors_surface_from_end() {
        let reg = ContextRegistry::new();
        let rec = Arc::new(Recorder { fail: true, ..Default::default() });
        reg.register("db", hook(&rec)).unwrap();
        let ctx = reg.begin();
        reg.activate(ctx, "db").unwrap();
        assert!(matches!(reg.end(ctx, false), Err(DbError::UnknownContext(_))));
        assert!(!reg.is_live(ctx));
    }

    #[test]
    fn dropped_scope_counts_as_failure() {
        let reg = Arc::new(ContextRegistry::new());
        let rec = Arc::new(Recorder::default());
        reg.register("db", hook(&rec)).unwrap();
        let ctx = {
            let scope = reg.scope();
            reg.activate(scope.id(), "db").unwrap();
            scope.id()
        };
        assert_eq!(*rec.calls.lock().unwrap(), vec![(ctx, true)]);
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn run_reports_failure_from_closure_result() {
        let reg = Arc::new(ContextRegistry::new());
        let rec = Arc::new(Recorder::default());
        reg.register("db", hook(&rec)).unwrap();

        let res: Result<(), DbError> = reg.run(|ctx| {
            reg.activate(ctx, "db")?;
            Err(DbError::NotDestroyable)
        });
        assert!(matches!(res, Err(DbError::NotDestroyable)));
        assert!(rec.calls.lock().unwrap()[0].1);
    }

    #[test]
    fn dead_members_are_skipped() {
        let reg = ContextRegistry::new();
        let rec = Arc::new(Recorder::default());
        reg.register("db", hook(&rec)).unwrap();
        let ctx = reg.begin();
        reg.activate(ctx, "db").unwrap();
        drop(rec);
        reg.end(ctx, false).unwrap();
    }
}
