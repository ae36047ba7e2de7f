//! Operation definitions, pushed instances, and the completion token.
//!
//! An operator definition ([`Opr`]) pairs a body with deduplicated read/write
//! variable sets and a scheduling property; it can be pushed any number of
//! times. Each push materializes an [`Instance`] carrying the per-push
//! execution context, priority, and the pending-dependency counter the
//! scheduler core drives to zero before dispatch.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::{Context, RunContext};
use crate::dependency::Var;
use crate::engine::core::EngineCore;
use crate::registry::{OprHandle, VarHandle};

/// Scheduling property, a hint for how the backend routes a ready operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum OpProperty {
    /// Ordinary compute work.
    Normal,
    /// Device-to-host transfer; routed to the dedicated copy lane so memory
    /// latency never stalls compute workers.
    CopyFromDevice,
    /// Host-to-device transfer; routed to the dedicated copy lane.
    CopyToDevice,
    /// Latency-sensitive CPU bookkeeping; jumps ahead of all normal-priority
    /// work in the CPU ready queue.
    PrioritizedCpu,
    /// Fire-and-forget asynchronous body: invoked once on the dispatching
    /// thread, it must arrange for its [`OnComplete`] to fire later.
    Async,
}

/// Body signature every scheduled operation runs with.
///
/// Synchronous callers never see this directly:
/// [`Engine::push_sync`](crate::engine::Engine::push_sync) wraps a plain
/// `Fn(RunContext)` in an invoke-then-complete adapter.
pub(crate) type Body = dyn Fn(RunContext, OnComplete) + Send + Sync;

/// One-shot completion token handed to an operation body.
///
/// Consuming it (via [`notify`](Self::notify)) tells the scheduler the
/// operation has finished and advances every touched variable's queue, which
/// may cascade-dispatch operations queued behind this one. Firing it twice is
/// a fatal programming error and panics: the token is consumed by value, but
/// the guard is still checked because a panicking body is force-completed at
/// the worker boundary.
pub struct OnComplete {
    core: Arc<EngineCore>,
    instance: Arc<Instance>,
}

impl OnComplete {
    pub(crate) fn new(core: Arc<EngineCore>, instance: Arc<Instance>) -> Self {
        Self { core, instance }
    }

    /// Signal completion of the operation this token was issued for.
    pub fn notify(self) {
        if self.instance.fired.swap(true, Ordering::AcqRel) {
            panic!(
                "completion signalled twice for operation on {}",
                self.instance.ctx
            );
        }
        self.core.complete(&self.instance);
    }
}

impl fmt::Debug for OnComplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnComplete")
            .field("ctx", &self.instance.ctx)
            .field("seq", &self.instance.seq)
            .finish()
    }
}

/// Deferred bookkeeping executed when an instance completes.
pub(crate) enum PostAction {
    /// Release the variable slot behind a drained delete barrier.
    FreeVar(VarHandle),
}

/// Reusable operator definition stored in the operator arena.
pub(crate) struct Opr {
    pub(crate) handle: OprHandle,
    pub(crate) body: Arc<Body>,
    /// Deduplicated access set; `true` marks a write.
    pub(crate) accesses: Vec<(Arc<Var>, bool)>,
    pub(crate) property: OpProperty,
    /// Pushed instances not yet completed; gates deferred deletion.
    pub(crate) pending_instances: AtomicUsize,
    pub(crate) to_delete: AtomicBool,
}

/// A single pushed occurrence of an operation.
pub(crate) struct Instance {
    pub(crate) body: Arc<Body>,
    pub(crate) accesses: Vec<(Arc<Var>, bool)>,
    pub(crate) ctx: Context,
    pub(crate) property: OpProperty,
    pub(crate) priority: i32,
    /// Push-order sequence, the tie-break among equal-priority ready work.
    pub(crate) seq: u64,
    /// Pending-dependency counter, preset to `accesses + 1`. The extra count
    /// is released after all accesses are registered, closing the race where
    /// an early dependency resolves while later accesses are still queueing.
    wait: AtomicUsize,
    pub(crate) fired: AtomicBool,
    /// Definition this instance was pushed from, if any.
    pub(crate) opr: Option<Arc<Opr>>,
    pub(crate) post: Option<PostAction>,
    /// Wait sentinel: admitted like a write but publishes no new version.
    pub(crate) barrier: bool,
}

impl Instance {
    pub(crate) fn new(
        body: Arc<Body>,
        accesses: Vec<(Arc<Var>, bool)>,
        ctx: Context,
        property: OpProperty,
        priority: i32,
        seq: u64,
        opr: Option<Arc<Opr>>,
        post: Option<PostAction>,
    ) -> Arc<Self> {
        let wait = AtomicUsize::new(accesses.len() + 1);
        Arc::new(Self {
            body,
            accesses,
            ctx,
            property,
            priority,
            seq,
            wait,
            fired: AtomicBool::new(false),
            opr,
            post,
            barrier: false,
        })
    }

    /// Build a wait sentinel for one variable.
    ///
    /// Queued as an exclusive access so it drains everything ahead of it,
    /// reads in flight included, but its completion bumps no version. Routed
    /// as prioritized CPU work so a wait never queues behind bulk compute.
    pub(crate) fn new_wait_barrier(body: Arc<Body>, var: Arc<Var>, seq: u64) -> Arc<Self> {
        Arc::new(Self {
            body,
            accesses: vec![(var, true)],
            ctx: Context::cpu(),
            property: OpProperty::PrioritizedCpu,
            priority: 0,
            seq,
            // One access plus the registration guard.
            wait: AtomicUsize::new(2),
            fired: AtomicBool::new(false),
            opr: None,
            post: None,
            barrier: true,
        })
    }

    /// Release one pending dependency; `true` when the instance became ready.
    pub(crate) fn satisfy_one(&self) -> bool {
        let previous = self.wait.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "dependency counter underflow");
        previous == 1
    }
}

/// Deduplicate access sets: sort, unique, and drop reads shadowed by writes.
///
/// A variable named in both sets is kept only as a write, since exclusive
/// access subsumes the read for the same operation.
pub(crate) fn dedup_accesses(
    mut reads: Vec<Arc<Var>>,
    mut writes: Vec<Arc<Var>>,
) -> Vec<(Arc<Var>, bool)> {
    writes.sort_by_key(|var| var.handle);
    writes.dedup_by_key(|var| var.handle);
    reads.sort_by_key(|var| var.handle);
    reads.dedup_by_key(|var| var.handle);
    reads.retain(|read| {
        writes
            .binary_search_by_key(&read.handle, |write| write.handle)
            .is_err()
    });

    reads
        .into_iter()
        .map(|var| (var, false))
        .chain(writes.into_iter().map(|var| (var, true)))
        .collect()
}
