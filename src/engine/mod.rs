//! Public engine façade.
//!
//! An [`Engine`] is an explicitly constructed instance: it owns its handle
//! registries, its scheduler state, and its execution backend, so multiple
//! engines with different configurations can coexist in one process.
//!
//! # Examples
//!
//! ```
//! use opweave::{Context, Engine, EngineConfig, OpProperty};
//!
//! # fn main() -> Result<(), opweave::EngineError> {
//! let engine = Engine::new(EngineConfig::default())?;
//! let var = engine.new_variable();
//! engine.push_sync(
//!     |_run_ctx| { /* mutate the resource behind `var` */ },
//!     Context::cpu(),
//!     &[],
//!     &[var],
//!     OpProperty::Normal,
//!     0,
//! );
//! engine.wait_for_var(var)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::backends::{self, ExecutionBackend};
use crate::config::{EngineConfig, ShutdownMode};
use crate::context::{Context, RunContext};
use crate::ops::{Body, OnComplete, OpProperty};
use crate::registry::{OprHandle, VarHandle};

pub(crate) mod core;

use self::core::EngineCore;

/// Errors surfaced by engine construction and wait calls.
///
/// Scheduling itself is infallible by design: push calls return `()` and
/// misuse of handles (use-after-delete, double completion) is a panic, not an
/// error. What remains fallible is construction and the deferred failure
/// reporting at wait points.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// An operation body panicked. The panic was caught at the worker
    /// boundary, the operation was force-completed so dependents could
    /// proceed, and the first such failure is reported at the next wait.
    #[error("operation body panicked on {context}: {message}")]
    #[diagnostic(
        code(opweave::engine::task_panicked),
        help("dependents of the failed operation were released; the resources it was mutating may be in a partial state")
    )]
    TaskPanicked { context: String, message: String },

    /// The configuration cannot produce a working engine.
    #[error("invalid engine configuration: {0}")]
    #[diagnostic(code(opweave::engine::config))]
    InvalidConfig(String),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread")]
    #[diagnostic(code(opweave::engine::spawn))]
    Spawn(#[from] std::io::Error),
}

/// Dependency-tracked execution engine.
///
/// Callers register variables (ordering tokens for resources the engine never
/// sees), then push operations tagged with the variables they read and
/// write. The engine runs operations as soon as their dependencies allow,
/// exploiting all parallelism the access sets permit while serializing
/// conflicting access.
pub struct Engine {
    core: Arc<EngineCore>,
    backend: Arc<dyn ExecutionBackend>,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine from the given configuration.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        validate(&config)?;
        let core = EngineCore::new();
        let backend = backends::build_backend(&config, &core)?;
        core.install_backend(Arc::clone(&backend));
        tracing::debug!(
            kind = %config.kind,
            cpu_workers = config.cpu_workers,
            copy_workers = config.copy_workers,
            streams_per_device = config.streams_per_device,
            "engine started"
        );
        Ok(Self {
            core,
            backend,
            config,
        })
    }

    /// Build an engine with defaults plus environment overrides.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::new(EngineConfig::from_env())
    }

    /// Register a fresh variable.
    ///
    /// The handle is an ordering token only; the engine never touches the
    /// resource it stands for.
    pub fn new_variable(&self) -> VarHandle {
        self.core.new_variable()
    }

    /// Register a reusable operator definition.
    ///
    /// The access sets are deduplicated: repeats collapse, and a variable
    /// named in both sets is kept only as a write. Panics if any handle is
    /// stale or deleted.
    pub fn new_operator<F>(
        &self,
        body: F,
        const_vars: &[VarHandle],
        mutable_vars: &[VarHandle],
        property: OpProperty,
    ) -> OprHandle
    where
        F: Fn(RunContext, OnComplete) + Send + Sync + 'static,
    {
        let body: Arc<Body> = Arc::new(body);
        self.core
            .new_operator(body, const_vars, mutable_vars, property)
    }

    /// Schedule an operator for deletion.
    ///
    /// Instances already pushed still run; the definition is reclaimed once
    /// the last of them completes. Pushing the operator after this call is a
    /// programming error and panics.
    pub fn delete_operator(&self, opr: OprHandle) {
        self.core.delete_operator(opr);
    }

    /// Push one execution of a registered operator.
    ///
    /// Returns as soon as the operation is queued; higher `priority` wins
    /// among simultaneously ready CPU work.
    pub fn push(&self, opr: OprHandle, ctx: Context, priority: i32) {
        self.core.push_operator(opr, ctx, priority);
    }

    /// Push a one-shot asynchronous operation.
    ///
    /// The body receives an [`OnComplete`] token and may finish after
    /// returning; the operation completes when the token fires.
    pub fn push_async<F>(
        &self,
        body: F,
        ctx: Context,
        const_vars: &[VarHandle],
        mutable_vars: &[VarHandle],
        property: OpProperty,
        priority: i32,
    ) where
        F: Fn(RunContext, OnComplete) + Send + Sync + 'static,
    {
        let body: Arc<Body> = Arc::new(body);
        self.core
            .push_async(body, ctx, const_vars, mutable_vars, property, priority);
    }

    /// Push a one-shot synchronous operation.
    ///
    /// The body is wrapped in an adapter that signals completion as soon as
    /// it returns.
    pub fn push_sync<F>(
        &self,
        body: F,
        ctx: Context,
        const_vars: &[VarHandle],
        mutable_vars: &[VarHandle],
        property: OpProperty,
        priority: i32,
    ) where
        F: Fn(RunContext) + Send + Sync + 'static,
    {
        let body: Arc<Body> = Arc::new(move |run_ctx, done: OnComplete| {
            body(run_ctx);
            done.notify();
        });
        self.core
            .push_async(body, ctx, const_vars, mutable_vars, property, priority);
    }

    /// Schedule a variable for deletion.
    ///
    /// Queues a terminal write barrier behind everything already queued on
    /// the variable; once it drains, `cleanup` runs on `ctx` and the handle
    /// becomes invalid. Using the handle after this call panics.
    pub fn delete_variable<F>(&self, cleanup: F, ctx: Context, var: VarHandle)
    where
        F: FnOnce(RunContext) + Send + 'static,
    {
        self.core.delete_variable(Box::new(cleanup), ctx, var);
    }

    /// Block until every operation pushed before this call that touches
    /// `var` has completed, reads still in flight included, then surface any
    /// deferred failure. Operations pushed afterwards are not waited on.
    pub fn wait_for_var(&self, var: VarHandle) -> Result<(), EngineError> {
        self.core.wait_for_var(var)
    }

    /// Block until the engine is idle, then surface any deferred failure.
    pub fn wait_for_all(&self) -> Result<(), EngineError> {
        self.core.wait_for_all()
    }

    /// Completed-write count for a variable; a cheap dependency version for
    /// cache invalidation schemes built on top of the engine.
    pub fn var_version(&self, var: VarHandle) -> u64 {
        self.core.var_version(var)
    }

    /// Operations pushed and not yet completed.
    pub fn pending_ops(&self) -> usize {
        self.core.pending_ops()
    }

    /// Mark the engine as shutting down.
    ///
    /// Quiesces per-operation logging during interpreter/process teardown;
    /// scheduling behavior is unchanged.
    pub fn notify_shutdown(&self) {
        self.core.notify_shutdown();
    }

    /// JSON snapshot of scheduler state, for diagnosing stuck waits.
    pub fn dump_dependency_state(&self) -> serde_json::Value {
        self.core.dump()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.config.shutdown_mode == ShutdownMode::Drain {
            if let Err(err) = self.core.wait_for_all() {
                tracing::error!(error = %err, "failure surfaced while draining engine at drop");
            }
        }
        self.core.notify_shutdown();
        self.backend.shutdown(self.config.shutdown_mode);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pending_ops", &self.core.pending_ops())
            .finish()
    }
}

fn validate(config: &EngineConfig) -> Result<(), EngineError> {
    if config.cpu_workers == 0 {
        return Err(EngineError::InvalidConfig(
            "cpu_workers must be at least 1".into(),
        ));
    }
    if config.copy_workers == 0 {
        return Err(EngineError::InvalidConfig(
            "copy_workers must be at least 1".into(),
        ));
    }
    if config.streams_per_device == 0 {
        return Err(EngineError::InvalidConfig(
            "streams_per_device must be at least 1".into(),
        ));
    }
    Ok(())
}
