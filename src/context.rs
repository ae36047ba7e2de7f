//! Execution contexts: where an operation runs.
//!
//! A [`Context`] names a device class plus a device ordinal. The engine never
//! interprets device ids beyond routing: CPU work goes to the shared CPU
//! worker pool, device work is serialized per `(Device, id)` lane unless the
//! backend is configured with multiple streams per device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device class an operation is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    /// Host CPU; scheduled onto the shared worker pool.
    Cpu,
    /// An accelerator device; scheduled onto a per-device lane.
    Device,
}

/// A `(device type, device id)` pair identifying where an operation must run.
///
/// # Examples
///
/// ```
/// use opweave::context::Context;
///
/// let host = Context::cpu();
/// let accel = Context::device(1);
/// assert!(host.is_cpu());
/// assert_eq!(accel.device_id, 1);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub device: DeviceType,
    pub device_id: usize,
}

impl Context {
    /// The host CPU context. CPU work ignores the device id.
    #[must_use]
    pub const fn cpu() -> Self {
        Self {
            device: DeviceType::Cpu,
            device_id: 0,
        }
    }

    /// An accelerator context for the given device ordinal.
    #[must_use]
    pub const fn device(device_id: usize) -> Self {
        Self {
            device: DeviceType::Device,
            device_id,
        }
    }

    /// Returns `true` for the host CPU context.
    #[must_use]
    pub fn is_cpu(&self) -> bool {
        matches!(self.device, DeviceType::Cpu)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Device => write!(f, "device:{}", self.device_id),
        }
    }
}

/// Per-invocation context handed to operation bodies.
///
/// Carries the resolved execution context; bodies that drive real devices use
/// it to pick a stream/queue. The engine adds nothing else: bodies are
/// arbitrary closures.
#[derive(Clone, Copy, Debug)]
pub struct RunContext {
    pub ctx: Context,
}
