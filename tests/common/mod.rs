//! Shared helpers for engine integration tests.
//!
//! Each test binary compiles its own copy, so not every helper is used
//! everywhere.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use opweave::{Engine, EngineConfig, EngineKind};

/// Engine running everything inline on the pushing thread.
pub fn inline_engine() -> Engine {
    Engine::new(EngineConfig::default().with_kind(EngineKind::Inline))
        .expect("inline engine construction")
}

/// Pooled engine with a fixed CPU lane width.
pub fn pooled_engine(cpu_workers: usize) -> Engine {
    Engine::new(
        EngineConfig::default()
            .with_kind(EngineKind::Pooled)
            .with_cpu_workers(cpu_workers),
    )
    .expect("pooled engine construction")
}

/// Thread-safe log of labeled timestamps, for asserting execution order
/// across workers.
#[derive(Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, label: impl Into<String>) {
        self.entries.lock().push((label.into(), Instant::now()));
    }

    /// Labels in the order they were recorded.
    pub fn labels(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn timestamp(&self, label: &str) -> Instant {
        self.entries
            .lock()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, at)| *at)
            .unwrap_or_else(|| panic!("no recording for label {label:?}"))
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Gauge tracking a current value and the maximum it ever reached.
#[derive(Clone, Default)]
pub struct PeakGauge {
    inner: Arc<Mutex<(i64, i64)>>,
}

impl PeakGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        let mut inner = self.inner.lock();
        inner.0 += 1;
        inner.1 = inner.1.max(inner.0);
    }

    pub fn exit(&self) {
        self.inner.lock().0 -= 1;
    }

    pub fn peak(&self) -> i64 {
        self.inner.lock().1
    }

    pub fn current(&self) -> i64 {
        self.inner.lock().0
    }
}
