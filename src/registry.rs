//! Generation-checked arenas for variable and operator slots.
//!
//! Handles are `(index, generation)` pairs. A slot's generation bumps every
//! time it is freed, so a stale handle can be detected instead of silently
//! aliasing whatever was allocated into the recycled slot. Detection is a
//! panic: using a freed handle is a programming error equivalent to
//! use-after-free, not a recoverable runtime condition.

use std::fmt;
use std::sync::Arc;

/// Handle to a variable registered with an engine.
///
/// Opaque token: carries identity only, never data. Obtained from
/// [`Engine::new_variable`](crate::engine::Engine::new_variable) and valid
/// until the deferred deletion scheduled by
/// [`Engine::delete_variable`](crate::engine::Engine::delete_variable) runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for VarHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}@{}", self.index, self.generation)
    }
}

/// Handle to a reusable operator definition.
///
/// The same definition can be pushed any number of times; deletion via
/// [`Engine::delete_operator`](crate::engine::Engine::delete_operator) is
/// deferred until no pushed instance is outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OprHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for OprHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}@{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Slab of recyclable slots guarded by the caller's lock.
///
/// Allocation pops the free list when possible, so handle churn (short-lived
/// temporaries in training loops) does not grow the slab without bound.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a slot, building the value from its `(index, generation)`
    /// pair so the value can embed its own handle.
    pub(crate) fn alloc_with<F>(&mut self, build: F) -> (u32, u32, Arc<T>)
    where
        F: FnOnce(u32, u32) -> T,
    {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            let value = Arc::new(build(index, generation));
            self.slots[index as usize].value = Some(Arc::clone(&value));
            (index, generation, value)
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena slot index overflow");
            let value = Arc::new(build(index, 0));
            self.slots.push(Slot {
                generation: 0,
                value: Some(Arc::clone(&value)),
            });
            (index, 0, value)
        }
    }

    /// Look up a live slot; `None` when the handle is stale or freed.
    pub(crate) fn get(&self, index: u32, generation: u32) -> Option<Arc<T>> {
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.clone()
    }

    /// Free a slot, bumping its generation so stale handles are caught.
    pub(crate) fn remove(&mut self, index: u32, generation: u32) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(value)
    }

    /// Iterate over live values (diagnostic dumps).
    pub(crate) fn iter_live(&self) -> impl Iterator<Item = &Arc<T>> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        self.iter_live().count()
    }
}
