//! Engine construction configuration.
//!
//! The engine is an explicitly constructed, dependency-injected instance; the
//! configuration selects the backend variant and sizes its lanes. Values can
//! come from the builder API or from environment overrides (a `.env` file is
//! honored via `dotenvy`), mirroring how deployments pick an engine variant
//! without recompiling.

use std::fmt;

/// Which execution backend the engine is built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Run every ready operation inline on the dispatching thread.
    /// Single-threaded semantics; useful for debugging dependency issues.
    Inline,
    /// CPU worker pool plus dedicated copy and per-device lanes.
    #[default]
    Pooled,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::Pooled => write!(f, "pooled"),
        }
    }
}

/// How workers treat queued work at teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Finish everything already queued before workers exit.
    #[default]
    Drain,
    /// Exit after the in-flight operation; queued work is dropped.
    Abandon,
}

/// Configuration for [`Engine::new`](crate::engine::Engine::new).
///
/// # Examples
///
/// ```
/// use opweave::config::{EngineConfig, EngineKind};
///
/// let config = EngineConfig::default()
///     .with_kind(EngineKind::Pooled)
///     .with_cpu_workers(4);
/// assert_eq!(config.cpu_workers, 4);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// CPU lane width; defaults to hardware concurrency.
    pub cpu_workers: usize,
    /// Dedicated memory-transfer lane width.
    pub copy_workers: usize,
    /// Worker threads per device id; 1 preserves stream ordering.
    pub streams_per_device: usize,
    pub shutdown_mode: ShutdownMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            cpu_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            copy_workers: 1,
            streams_per_device: 1,
            shutdown_mode: ShutdownMode::default(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from defaults plus environment overrides.
    ///
    /// Recognized variables: `OPWEAVE_ENGINE_KIND` (`inline`/`pooled`),
    /// `OPWEAVE_CPU_WORKERS`, `OPWEAVE_COPY_WORKERS`,
    /// `OPWEAVE_STREAMS_PER_DEVICE`, `OPWEAVE_SHUTDOWN_MODE`
    /// (`drain`/`abandon`). Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("OPWEAVE_ENGINE_KIND") {
            match raw.to_ascii_lowercase().as_str() {
                "inline" => config.kind = EngineKind::Inline,
                "pooled" => config.kind = EngineKind::Pooled,
                other => {
                    tracing::warn!(value = %other, "unrecognized OPWEAVE_ENGINE_KIND, keeping default");
                }
            }
        }
        if let Some(n) = parse_count("OPWEAVE_CPU_WORKERS") {
            config.cpu_workers = n;
        }
        if let Some(n) = parse_count("OPWEAVE_COPY_WORKERS") {
            config.copy_workers = n;
        }
        if let Some(n) = parse_count("OPWEAVE_STREAMS_PER_DEVICE") {
            config.streams_per_device = n;
        }
        if let Ok(raw) = std::env::var("OPWEAVE_SHUTDOWN_MODE") {
            match raw.to_ascii_lowercase().as_str() {
                "drain" => config.shutdown_mode = ShutdownMode::Drain,
                "abandon" => config.shutdown_mode = ShutdownMode::Abandon,
                other => {
                    tracing::warn!(value = %other, "unrecognized OPWEAVE_SHUTDOWN_MODE, keeping default");
                }
            }
        }
        config
    }

    #[must_use]
    pub fn with_kind(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_cpu_workers(mut self, cpu_workers: usize) -> Self {
        self.cpu_workers = cpu_workers;
        self
    }

    #[must_use]
    pub fn with_copy_workers(mut self, copy_workers: usize) -> Self {
        self.copy_workers = copy_workers;
        self
    }

    #[must_use]
    pub fn with_streams_per_device(mut self, streams_per_device: usize) -> Self {
        self.streams_per_device = streams_per_device;
        self
    }

    #[must_use]
    pub fn with_shutdown_mode(mut self, shutdown_mode: ShutdownMode) -> Self {
        self.shutdown_mode = shutdown_mode;
        self
    }
}

fn parse_count(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(var = name, value = %raw, "ignoring non-positive or unparsable worker count");
            None
        }
    }
}
