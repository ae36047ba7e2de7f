//! # Opweave: Dependency-Tracked Execution Engine
//!
//! Opweave schedules arbitrary operations against opaque *variables* and runs
//! each operation as soon as the variables it touches allow, extracting all
//! the parallelism the declared access sets permit while serializing
//! conflicting access.
//!
//! ## Core Concepts
//!
//! - **Variables**: Ordering tokens for resources the engine never sees;
//!   created with [`Engine::new_variable`]
//! - **Operations**: Closures pushed with declared read (`const_vars`) and
//!   write (`mutable_vars`) sets
//! - **Operators**: Reusable operation definitions pushed many times
//!   ([`Engine::new_operator`])
//! - **Contexts**: Where an operation runs, host CPU or a device ordinal
//! - **Backends**: Pluggable execution strategies selected by
//!   [`EngineConfig`]: a multi-lane worker pool or an inline single-threaded
//!   executor
//!
//! The consistency model is the usual reader/writer discipline per variable:
//! reads of the same variable run concurrently, writes are exclusive and
//! totally ordered, and operations touching disjoint variables never wait on
//! each other.
//!
//! ## Quick Start
//!
//! ```
//! use opweave::{Context, Engine, EngineConfig, OpProperty};
//!
//! # fn main() -> Result<(), opweave::EngineError> {
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! let weights = engine.new_variable();
//! let gradient = engine.new_variable();
//!
//! // Writes `gradient`.
//! engine.push_sync(
//!     |_run_ctx| { /* compute the gradient */ },
//!     Context::cpu(),
//!     &[],
//!     &[gradient],
//!     OpProperty::Normal,
//!     0,
//! );
//! // Reads `gradient`, writes `weights`; runs only after the line above.
//! engine.push_sync(
//!     |_run_ctx| { /* apply the update */ },
//!     Context::cpu(),
//!     &[gradient],
//!     &[weights],
//!     OpProperty::Normal,
//!     0,
//! );
//!
//! engine.wait_for_var(weights)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Model
//!
//! Push calls never fail. A panic inside an operation body is caught at the
//! worker boundary, the operation is force-completed so dependents are not
//! wedged, and the first failure is returned from the next
//! [`Engine::wait_for_var`] or [`Engine::wait_for_all`] as
//! [`EngineError::TaskPanicked`]. Handle misuse (pushing a deleted operator,
//! touching a deleted variable) is a panic, not an error.

pub mod config;
pub mod context;
pub mod engine;
pub mod ops;
pub mod registry;
pub mod telemetry;

mod backends;
pub(crate) mod dependency;

pub use config::{EngineConfig, EngineKind, ShutdownMode};
pub use context::{Context, DeviceType, RunContext};
pub use engine::{Engine, EngineError};
pub use ops::{OnComplete, OpProperty};
pub use registry::{OprHandle, VarHandle};
