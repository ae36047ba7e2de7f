//! Per-variable dependency tracking.
//!
//! Each variable owns an ordered queue of pending accesses and decides,
//! independently of every other variable, when a queued access may run. This
//! is the engine's only serialization point, so the state is guarded by a
//! per-variable mutex rather than any global lock.
//!
//! Admission rules:
//! - any number of reads may be in flight together, never alongside a write;
//! - at most one write is in flight, only once the queue ahead of it has
//!   drained and every admitted reader has finished;
//! - a contiguous run of reads at the head of the queue is admitted as a
//!   group.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ops::Instance;
use crate::registry::VarHandle;

/// One pending access queued against a variable.
pub(crate) struct QueuedAccess {
    pub(crate) instance: Arc<Instance>,
    pub(crate) write: bool,
}

#[derive(Default)]
struct VarState {
    queue: VecDeque<QueuedAccess>,
    /// Reads admitted and not yet completed.
    running_reads: usize,
    /// Whether a write has been admitted and not yet completed.
    write_in_flight: bool,
    /// Completed-write count; the variable's dependency version.
    version: u64,
    /// Set once a delete barrier has been queued; later accesses panic.
    sealed: bool,
}

/// Diagnostic snapshot of one variable's queue, for deadlock debugging.
#[derive(Clone, Debug, Serialize)]
pub struct VarDump {
    pub var: String,
    pub queued: usize,
    pub running_reads: usize,
    pub write_in_flight: bool,
    pub version: u64,
    pub sealed: bool,
}

/// Internal representation of a variable: identity plus its access queue.
pub(crate) struct Var {
    pub(crate) handle: VarHandle,
    state: Mutex<VarState>,
}

impl Var {
    pub(crate) fn new(handle: VarHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(VarState::default()),
        }
    }

    /// Reject access to a sealed variable before any engine state changes.
    ///
    /// Pushing against a deleted variable is fatal misuse; panicking here,
    /// ahead of the pending-count bump and queue appends, keeps the engine
    /// consistent for whatever catches the unwind.
    pub(crate) fn check_open(&self, terminal: bool) {
        if self.state.lock().sealed {
            if terminal {
                panic!("variable {} deleted twice", self.handle);
            }
            panic!("variable {} used after delete was scheduled", self.handle);
        }
    }

    /// Append an access, returning `true` when it is immediately admissible.
    ///
    /// An admissible access is marked in flight before the lock is released,
    /// so a concurrent completion on this variable cannot admit it twice.
    pub(crate) fn append(&self, access: QueuedAccess) -> bool {
        let mut state = self.state.lock();
        assert!(
            !state.sealed,
            "variable {} used after delete was scheduled",
            self.handle
        );
        self.append_locked(&mut state, access)
    }

    /// Append the terminal delete barrier and seal the variable in the same
    /// critical section, so no access can slip in between.
    pub(crate) fn append_terminal(&self, access: QueuedAccess) -> bool {
        let mut state = self.state.lock();
        assert!(
            !state.sealed,
            "variable {} deleted twice",
            self.handle
        );
        let admitted = self.append_locked(&mut state, access);
        state.sealed = true;
        admitted
    }

    fn append_locked(&self, state: &mut VarState, access: QueuedAccess) -> bool {
        if access.write {
            if state.queue.is_empty() && !state.write_in_flight && state.running_reads == 0 {
                state.write_in_flight = true;
                return true;
            }
        } else if state.queue.is_empty() && !state.write_in_flight {
            state.running_reads += 1;
            return true;
        }
        state.queue.push_back(access);
        false
    }

    /// Retire a completed access and admit whatever became eligible.
    ///
    /// A `barrier` access is admitted and retired like a write but publishes
    /// no new version; wait sentinels use it to drain the queue without
    /// looking like a mutation. Instances whose pending-dependency counter
    /// reached zero are pushed into `ready`; the caller dispatches them after
    /// this lock is released.
    pub(crate) fn complete(&self, was_write: bool, barrier: bool, ready: &mut Vec<Arc<Instance>>) {
        let mut state = self.state.lock();
        if was_write {
            assert!(
                state.write_in_flight,
                "write completed on {} with no write in flight",
                self.handle
            );
            state.write_in_flight = false;
            if !barrier {
                state.version += 1;
            }
        } else {
            assert!(
                state.running_reads > 0,
                "read completed on {} with no reads in flight",
                self.handle
            );
            state.running_reads -= 1;
        }

        while let Some(head) = state.queue.front() {
            if head.write {
                if !state.write_in_flight && state.running_reads == 0 {
                    let access = state.queue.pop_front().expect("head exists");
                    state.write_in_flight = true;
                    if access.instance.satisfy_one() {
                        ready.push(access.instance);
                    }
                }
                // A head write blocks everything behind it either way.
                break;
            }
            if state.write_in_flight {
                break;
            }
            let access = state.queue.pop_front().expect("head exists");
            state.running_reads += 1;
            if access.instance.satisfy_one() {
                ready.push(access.instance);
            }
        }
    }

    /// Completed-write count for this variable.
    pub(crate) fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub(crate) fn dump(&self) -> VarDump {
        let state = self.state.lock();
        VarDump {
            var: self.handle.to_string(),
            queued: state.queue.len(),
            running_reads: state.running_reads,
            write_in_flight: state.write_in_flight,
            version: state.version,
            sealed: state.sealed,
        }
    }
}
