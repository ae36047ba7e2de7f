//! Scheduler core: handle registries, dependency counting, dispatch, and the
//! completion protocol.
//!
//! The core owns the variable and operator arenas, the engine-wide pending
//! count that `wait_for_all` drains, and the deferred-failure slot that
//! surfaces body panics at the next wait call. Dependency ordering itself
//! lives with each variable in [`crate::dependency`]; the core only wires
//! admissions to dispatch and completions to cascades.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use serde_json::json;

use crate::backends::ExecutionBackend;
use crate::context::{Context, RunContext};
use crate::dependency::{QueuedAccess, Var};
use crate::ops::{dedup_accesses, Body, Instance, OnComplete, OpProperty, Opr, PostAction};
use crate::registry::{Arena, OprHandle, VarHandle};

use super::EngineError;

pub(crate) struct EngineCore {
    vars: Mutex<Arena<Var>>,
    oprs: Mutex<Arena<Opr>>,
    /// Outstanding pushed instances; guarded by a mutex so `wait_for_all`
    /// can park on the paired condvar.
    pending: Mutex<usize>,
    idle: Condvar,
    seq: AtomicU64,
    shutdown: AtomicBool,
    /// First body failure since the last wait call; later failures are
    /// logged but not stored.
    failure: Mutex<Option<EngineError>>,
    backend: OnceLock<Arc<dyn ExecutionBackend>>,
}

impl EngineCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(Arena::new()),
            oprs: Mutex::new(Arena::new()),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
            backend: OnceLock::new(),
        })
    }

    pub(crate) fn install_backend(&self, backend: Arc<dyn ExecutionBackend>) {
        if self.backend.set(backend).is_err() {
            panic!("execution backend installed twice");
        }
    }

    fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        self.backend
            .get()
            .expect("engine used before backend installation")
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn notify_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    pub(crate) fn new_variable(&self) -> VarHandle {
        let (index, generation, _) = self
            .vars
            .lock()
            .alloc_with(|index, generation| Var::new(VarHandle { index, generation }));
        VarHandle { index, generation }
    }

    /// Resolve a variable handle; a stale or deleted handle is a
    /// use-after-free and panics.
    pub(crate) fn resolve_var(&self, handle: VarHandle) -> Arc<Var> {
        self.vars
            .lock()
            .get(handle.index, handle.generation)
            .unwrap_or_else(|| panic!("variable handle {handle} is stale or deleted"))
    }

    fn resolve_opr(&self, handle: OprHandle) -> Arc<Opr> {
        self.oprs
            .lock()
            .get(handle.index, handle.generation)
            .unwrap_or_else(|| panic!("operator handle {handle} is stale or deleted"))
    }

    pub(crate) fn new_operator(
        &self,
        body: Arc<Body>,
        const_vars: &[VarHandle],
        mutable_vars: &[VarHandle],
        property: OpProperty,
    ) -> OprHandle {
        let reads = const_vars.iter().map(|&h| self.resolve_var(h)).collect();
        let writes = mutable_vars.iter().map(|&h| self.resolve_var(h)).collect();
        let accesses = dedup_accesses(reads, writes);
        let (index, generation, _) = self.oprs.lock().alloc_with(|index, generation| Opr {
            handle: OprHandle { index, generation },
            body,
            accesses,
            property,
            pending_instances: AtomicUsize::new(0),
            to_delete: AtomicBool::new(false),
        });
        OprHandle { index, generation }
    }

    /// Mark an operator deleted; the slot is released once the last pushed
    /// instance completes (or immediately when none is outstanding).
    pub(crate) fn delete_operator(&self, handle: OprHandle) {
        let opr = self.resolve_opr(handle);
        opr.to_delete.store(true, Ordering::Release);
        if opr.pending_instances.load(Ordering::Acquire) == 0 {
            self.free_operator(handle);
        }
    }

    fn free_operator(&self, handle: OprHandle) {
        // Both the delete call and the last completion may race here; the
        // arena ignores the second remove.
        if self.oprs.lock().remove(handle.index, handle.generation).is_some() {
            tracing::trace!(opr = %handle, "operator slot released");
        }
    }

    fn free_variable(&self, handle: VarHandle) {
        if self.vars.lock().remove(handle.index, handle.generation).is_some() {
            tracing::trace!(var = %handle, "variable slot released");
        }
    }

    pub(crate) fn var_version(&self, handle: VarHandle) -> u64 {
        self.resolve_var(handle).version()
    }

    // ------------------------------------------------------------------
    // Push paths
    // ------------------------------------------------------------------

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn push_operator(
        self: &Arc<Self>,
        handle: OprHandle,
        ctx: Context,
        priority: i32,
    ) {
        let opr = self.resolve_opr(handle);
        assert!(
            !opr.to_delete.load(Ordering::Acquire),
            "operator {handle} pushed after delete"
        );
        opr.pending_instances.fetch_add(1, Ordering::AcqRel);
        let instance = Instance::new(
            Arc::clone(&opr.body),
            opr.accesses.clone(),
            ctx,
            opr.property,
            priority,
            self.next_seq(),
            Some(opr),
            None,
        );
        self.push_instance(instance, false);
    }

    pub(crate) fn push_async(
        self: &Arc<Self>,
        body: Arc<Body>,
        ctx: Context,
        const_vars: &[VarHandle],
        mutable_vars: &[VarHandle],
        property: OpProperty,
        priority: i32,
    ) {
        let reads = const_vars.iter().map(|&h| self.resolve_var(h)).collect();
        let writes = mutable_vars.iter().map(|&h| self.resolve_var(h)).collect();
        let accesses = dedup_accesses(reads, writes);
        let instance = Instance::new(
            body,
            accesses,
            ctx,
            property,
            priority,
            self.next_seq(),
            None,
            None,
        );
        self.push_instance(instance, false);
    }

    /// Queue the terminal write barrier for a variable. Once it drains, the
    /// cleanup body has run on `ctx` and the slot is released.
    pub(crate) fn delete_variable(
        self: &Arc<Self>,
        cleanup: Box<dyn FnOnce(RunContext) + Send>,
        ctx: Context,
        handle: VarHandle,
    ) {
        let var = self.resolve_var(handle);
        let cleanup = Mutex::new(Some(cleanup));
        let body: Arc<Body> = Arc::new(move |run_ctx, done: OnComplete| {
            if let Some(f) = cleanup.lock().take() {
                f(run_ctx);
            }
            done.notify();
        });
        let instance = Instance::new(
            body,
            vec![(var, true)],
            ctx,
            OpProperty::Normal,
            0,
            self.next_seq(),
            None,
            Some(PostAction::FreeVar(handle)),
        );
        self.push_instance(instance, true);
    }

    /// Register an instance's accesses and dispatch it if everything is
    /// already satisfiable at push time.
    fn push_instance(self: &Arc<Self>, instance: Arc<Instance>, terminal: bool) {
        // Reject misuse before touching any engine state: a panic past this
        // point would inflate the pending count or leave queue entries
        // dangling on variables already appended.
        for (var, _) in &instance.accesses {
            var.check_open(terminal);
        }
        {
            let mut pending = self.pending.lock();
            *pending += 1;
        }
        if !self.is_shutdown() {
            tracing::trace!(
                seq = instance.seq,
                ctx = %instance.ctx,
                accesses = instance.accesses.len(),
                "operation pushed"
            );
        }
        for (var, write) in &instance.accesses {
            let access = QueuedAccess {
                instance: Arc::clone(&instance),
                write: *write,
            };
            let admitted = if terminal {
                var.append_terminal(access)
            } else {
                var.append(access)
            };
            if admitted {
                // The registration guard keeps the counter above zero until
                // every access has been appended.
                let became_ready = instance.satisfy_one();
                assert!(!became_ready, "instance ready before registration finished");
            }
        }
        if instance.satisfy_one() {
            self.dispatch(&instance);
        }
    }

    fn dispatch(self: &Arc<Self>, instance: &Arc<Instance>) {
        if !self.is_shutdown() {
            tracing::trace!(seq = instance.seq, ctx = %instance.ctx, "operation ready");
        }
        self.backend().dispatch(self, Arc::clone(instance));
    }

    // ------------------------------------------------------------------
    // Execution & completion
    // ------------------------------------------------------------------

    /// Invoke an instance's body on the current thread. Panics inside the
    /// body are caught, recorded for the next wait call, and force-completed
    /// so dependents are not wedged behind a crashed operation.
    pub(crate) fn run(self: &Arc<Self>, instance: &Arc<Instance>) {
        let done = OnComplete::new(Arc::clone(self), Arc::clone(instance));
        let run_ctx = RunContext { ctx: instance.ctx };
        let body = Arc::clone(&instance.body);
        let result = catch_unwind(AssertUnwindSafe(|| body(run_ctx, done)));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                seq = instance.seq,
                ctx = %instance.ctx,
                accesses = instance.accesses.len(),
                %message,
                "operation body panicked"
            );
            self.record_failure(instance, message);
            if !instance.fired.swap(true, Ordering::AcqRel) {
                self.complete(instance);
            }
        }
    }

    /// Completion protocol: retire every access, cascade newly admitted
    /// work, settle deferred operator/variable reclamation, and wake waiters.
    pub(crate) fn complete(self: &Arc<Self>, instance: &Arc<Instance>) {
        let mut ready = Vec::new();
        for (var, write) in &instance.accesses {
            var.complete(*write, instance.barrier, &mut ready);
        }

        if let Some(opr) = &instance.opr {
            let outstanding = opr.pending_instances.fetch_sub(1, Ordering::AcqRel);
            assert!(outstanding > 0, "operator pending-instance underflow");
            if outstanding == 1 && opr.to_delete.load(Ordering::Acquire) {
                self.free_operator(opr.handle);
            }
        }

        if let Some(PostAction::FreeVar(handle)) = &instance.post {
            self.free_variable(*handle);
        }

        {
            let mut pending = self.pending.lock();
            *pending = pending
                .checked_sub(1)
                .expect("engine pending-operation underflow");
            if *pending == 0 {
                self.idle.notify_all();
            }
        }

        for next in ready {
            self.dispatch(&next);
        }
    }

    fn record_failure(&self, instance: &Arc<Instance>, message: String) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(EngineError::TaskPanicked {
                context: instance.ctx.to_string(),
                message,
            });
        }
    }

    fn take_failure(&self) -> Result<(), EngineError> {
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------

    /// Block until every operation pushed before this call that touches the
    /// variable has completed, reads still in flight included. The sentinel
    /// is a barrier access: it drains the queue like a write without
    /// publishing a version.
    pub(crate) fn wait_for_var(self: &Arc<Self>, handle: VarHandle) -> Result<(), EngineError> {
        let var = self.resolve_var(handle);
        let (tx, rx) = flume::bounded::<()>(1);
        let body: Arc<Body> = Arc::new(move |_run_ctx, done: OnComplete| {
            let _ = tx.send(());
            done.notify();
        });
        let instance = Instance::new_wait_barrier(body, var, self.next_seq());
        self.push_instance(instance, false);
        // A recv error means the backend abandoned the sentinel at teardown.
        let _ = rx.recv();
        self.take_failure()
    }

    /// Block until the engine-wide pending count reaches zero.
    pub(crate) fn wait_for_all(&self) -> Result<(), EngineError> {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
        drop(pending);
        self.take_failure()
    }

    pub(crate) fn pending_ops(&self) -> usize {
        *self.pending.lock()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Snapshot of per-variable queue state, for diagnosing stuck waits.
    pub(crate) fn dump(&self) -> serde_json::Value {
        let vars: Vec<_> = self.vars.lock().iter_live().map(|var| var.dump()).collect();
        json!({
            "pending_operations": self.pending_ops(),
            "shutdown": self.is_shutdown(),
            "vars": vars,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
