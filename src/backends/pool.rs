//! Pooled backend: CPU worker pool plus dedicated copy and per-device lanes.
//!
//! Lane layout mirrors the cost model of tensor workloads. CPU compute shares
//! a pool fed from a priority heap (prioritized bookkeeping first, then
//! caller priority, then push order). Memory transfers get their own FIFO
//! lane so a slow copy never occupies a compute worker. Each device ordinal
//! gets its own FIFO lane, spawned lazily on first use, with
//! `streams_per_device` workers; one worker per device preserves stream
//! ordering.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::config::{EngineConfig, ShutdownMode};
use crate::context::DeviceType;
use crate::engine::core::EngineCore;
use crate::engine::EngineError;
use crate::ops::{Instance, OpProperty};

use super::ExecutionBackend;

pub(crate) struct PoolBackend {
    cpu: CpuLane,
    copy: FifoLane,
    devices: Mutex<FxHashMap<usize, FifoLane>>,
    streams_per_device: usize,
    /// When set, workers drop queued work instead of running it.
    abandon: Arc<AtomicBool>,
    down: AtomicBool,
}

impl PoolBackend {
    pub(crate) fn new(config: &EngineConfig, core: &Arc<EngineCore>) -> Result<Self, EngineError> {
        let abandon = Arc::new(AtomicBool::new(false));
        let cpu = CpuLane::spawn(config.cpu_workers, core, &abandon)?;
        let copy = FifoLane::spawn("opweave-copy", config.copy_workers, core, &abandon)?;
        Ok(Self {
            cpu,
            copy,
            devices: Mutex::new(FxHashMap::default()),
            streams_per_device: config.streams_per_device,
            abandon,
            down: AtomicBool::new(false),
        })
    }

    fn dispatch_device(&self, core: &Arc<EngineCore>, instance: Arc<Instance>) {
        let device_id = instance.ctx.device_id;
        let mut devices = self.devices.lock();
        if !devices.contains_key(&device_id) {
            let name = format!("opweave-dev{device_id}");
            match FifoLane::spawn(&name, self.streams_per_device, core, &self.abandon) {
                Ok(lane) => {
                    devices.insert(device_id, lane);
                }
                Err(err) => {
                    drop(devices);
                    tracing::error!(device_id, error = %err, "device lane spawn failed, running inline");
                    core.run(&instance);
                    return;
                }
            }
        }
        let lane = devices.get(&device_id).expect("lane just ensured");
        lane.send(instance);
    }
}

impl ExecutionBackend for PoolBackend {
    fn dispatch(&self, core: &Arc<EngineCore>, instance: Arc<Instance>) {
        match instance.property {
            // Async bodies only arrange completion; run them where dispatched.
            OpProperty::Async => core.run(&instance),
            OpProperty::CopyFromDevice | OpProperty::CopyToDevice => self.copy.send(instance),
            OpProperty::PrioritizedCpu => self.cpu.push(RankedTask::new(instance, true)),
            OpProperty::Normal => match instance.ctx.device {
                DeviceType::Cpu => self.cpu.push(RankedTask::new(instance, false)),
                DeviceType::Device => self.dispatch_device(core, instance),
            },
        }
    }

    fn shutdown(&self, mode: ShutdownMode) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        if mode == ShutdownMode::Abandon {
            self.abandon.store(true, Ordering::Release);
        }
        self.cpu.shutdown();
        self.copy.shutdown();
        let lanes: Vec<FifoLane> = {
            let mut devices = self.devices.lock();
            devices.drain().map(|(_, lane)| lane).collect()
        };
        for lane in &lanes {
            lane.shutdown();
        }
    }
}

/// Ready CPU task ranked for the heap: prioritized flag, then caller
/// priority, then earliest push order.
struct RankedTask {
    prioritized: bool,
    priority: i32,
    seq: u64,
    instance: Arc<Instance>,
}

impl RankedTask {
    fn new(instance: Arc<Instance>, prioritized: bool) -> Self {
        Self {
            prioritized,
            priority: instance.priority,
            seq: instance.seq,
            instance,
        }
    }
}

impl PartialEq for RankedTask {
    fn eq(&self, other: &Self) -> bool {
        self.prioritized == other.prioritized
            && self.priority == other.priority
            && self.seq == other.seq
    }
}

impl Eq for RankedTask {}

impl PartialOrd for RankedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.prioritized
            .cmp(&other.prioritized)
            .then_with(|| self.priority.cmp(&other.priority))
            // Lower seq ranks higher among equals.
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct CpuQueue {
    heap: BinaryHeap<RankedTask>,
    closed: bool,
}

struct CpuShared {
    queue: Mutex<CpuQueue>,
    available: Condvar,
}

struct CpuLane {
    shared: Arc<CpuShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuLane {
    fn spawn(
        count: usize,
        core: &Arc<EngineCore>,
        abandon: &Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        let shared = Arc::new(CpuShared {
            queue: Mutex::new(CpuQueue {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(count);
        for worker in 0..count {
            let shared = Arc::clone(&shared);
            let core = Arc::clone(core);
            let abandon = Arc::clone(abandon);
            let handle = std::thread::Builder::new()
                .name(format!("opweave-cpu-{worker}"))
                .spawn(move || cpu_worker(&shared, &core, &abandon))?;
            workers.push(handle);
        }
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    fn push(&self, task: RankedTask) {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            tracing::warn!(seq = task.seq, "cpu lane closed, dropping dispatched operation");
            return;
        }
        queue.heap.push(task);
        drop(queue);
        self.shared.available.notify_one();
    }

    fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
        }
        self.shared.available.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("cpu worker thread panicked outside an operation body");
            }
        }
    }
}

fn cpu_worker(shared: &CpuShared, core: &Arc<EngineCore>, abandon: &AtomicBool) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.heap.pop() {
                    break Some(task);
                }
                if queue.closed {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        let Some(task) = task else {
            return;
        };
        if abandon.load(Ordering::Acquire) {
            continue;
        }
        core.run(&task.instance);
    }
}

/// FIFO lane: an unbounded channel drained by a fixed set of workers. Used
/// for the copy lane and for per-device lanes.
struct FifoLane {
    tx: Mutex<Option<flume::Sender<Arc<Instance>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FifoLane {
    fn spawn(
        name: &str,
        count: usize,
        core: &Arc<EngineCore>,
        abandon: &Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = flume::unbounded::<Arc<Instance>>();
        let mut workers = Vec::with_capacity(count);
        for worker in 0..count {
            let rx = rx.clone();
            let core = Arc::clone(core);
            let abandon = Arc::clone(abandon);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn(move || {
                    while let Ok(instance) = rx.recv() {
                        if abandon.load(Ordering::Acquire) {
                            continue;
                        }
                        core.run(&instance);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    fn send(&self, instance: Arc<Instance>) {
        let seq = instance.seq;
        let sent = match &*self.tx.lock() {
            Some(tx) => tx.send(instance).is_ok(),
            None => false,
        };
        if !sent {
            tracing::warn!(seq, "lane closed, dropping dispatched operation");
        }
    }

    /// Close the channel and join the workers; remaining queued items are
    /// drained (or skipped, under abandon) before the workers exit.
    fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("lane worker thread panicked outside an operation body");
            }
        }
    }
}
