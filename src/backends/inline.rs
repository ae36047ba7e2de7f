//! Inline backend: run every ready operation on the dispatching thread.

use std::sync::Arc;

use crate::config::ShutdownMode;
use crate::engine::core::EngineCore;
use crate::ops::Instance;

use super::ExecutionBackend;

/// Executes ready operations immediately, giving single-threaded, push-order
/// semantics. Completion cascades recurse on the caller's stack, which is
/// fine for the debugging and test workloads this backend exists for.
pub(crate) struct InlineBackend;

impl ExecutionBackend for InlineBackend {
    fn dispatch(&self, core: &Arc<EngineCore>, instance: Arc<Instance>) {
        core.run(&instance);
    }

    fn shutdown(&self, _mode: ShutdownMode) {}
}
