//! Execution backends: the strategy behind dispatch.
//!
//! The scheduler core decides *when* an operation is ready; the backend
//! decides *where* it runs. Backends are plain injected values selected by
//! [`EngineConfig`](crate::config::EngineConfig), so two engines in one
//! process can use different strategies.

use std::sync::Arc;

use crate::config::{EngineConfig, EngineKind, ShutdownMode};
use crate::engine::core::EngineCore;
use crate::engine::EngineError;
use crate::ops::Instance;

mod inline;
mod pool;

pub(crate) use inline::InlineBackend;
pub(crate) use pool::PoolBackend;

/// Strategy interface the scheduler core dispatches through.
///
/// Implementations never hold an `Arc<EngineCore>` themselves; the core is
/// passed by reference on each dispatch (worker threads clone it into their
/// closures), which keeps the core/backend reference graph acyclic.
pub(crate) trait ExecutionBackend: Send + Sync {
    /// Route a ready instance to an executor. Must not block on the
    /// instance's own completion.
    fn dispatch(&self, core: &Arc<EngineCore>, instance: Arc<Instance>);

    /// Tear down executor resources. Idempotent.
    fn shutdown(&self, mode: ShutdownMode);
}

pub(crate) fn build_backend(
    config: &EngineConfig,
    core: &Arc<EngineCore>,
) -> Result<Arc<dyn ExecutionBackend>, EngineError> {
    match config.kind {
        EngineKind::Inline => Ok(Arc::new(InlineBackend)),
        EngineKind::Pooled => Ok(Arc::new(PoolBackend::new(config, core)?)),
    }
}
