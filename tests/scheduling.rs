//! Ordering and parallelism guarantees of the pooled engine.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{inline_engine, pooled_engine, PeakGauge, Recorder};
use opweave::{Context, Engine, OpProperty};

#[test]
fn writes_to_one_variable_run_in_push_order() {
    let engine = pooled_engine(4);
    let rec = Recorder::new();
    let var = engine.new_variable();

    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| {
                std::thread::sleep(Duration::from_millis(40));
                rec.mark("w1");
            },
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }
    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| rec.mark("w2"),
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }

    engine.wait_for_var(var).unwrap();
    assert_eq!(rec.labels(), ["w1", "w2"]);
    assert_eq!(engine.var_version(var), 2);
}

#[test]
fn reads_overlap_and_never_mix_with_writes() {
    let engine = pooled_engine(4);
    let rec = Recorder::new();
    let reads = PeakGauge::new();
    let mixed = Arc::new(AtomicBool::new(false));
    let var = engine.new_variable();

    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| rec.mark("w1"),
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }
    for _ in 0..4 {
        let reads = reads.clone();
        engine.push_sync(
            move |_| {
                reads.enter();
                std::thread::sleep(Duration::from_millis(50));
                reads.exit();
            },
            Context::cpu(),
            &[var],
            &[],
            OpProperty::Normal,
            0,
        );
    }
    {
        let rec = rec.clone();
        let reads = reads.clone();
        let mixed = Arc::clone(&mixed);
        engine.push_sync(
            move |_| {
                if reads.current() != 0 {
                    mixed.store(true, Ordering::Relaxed);
                }
                rec.mark("w2");
            },
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }

    engine.wait_for_all().unwrap();
    assert!(reads.peak() >= 2, "reads should run concurrently");
    assert!(!mixed.load(Ordering::Relaxed), "write overlapped a read");
    assert_eq!(rec.labels(), ["w1", "w2"]);
}

#[test]
fn disjoint_variables_run_in_parallel() {
    let engine = pooled_engine(2);
    let gauge = PeakGauge::new();

    for _ in 0..2 {
        let gauge = gauge.clone();
        let var = engine.new_variable();
        engine.push_sync(
            move |_| {
                gauge.enter();
                std::thread::sleep(Duration::from_millis(100));
                gauge.exit();
            },
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }

    engine.wait_for_all().unwrap();
    assert_eq!(gauge.peak(), 2);
}

#[test]
fn async_operation_completes_after_body_returns() {
    let engine = pooled_engine(1);
    let rec = Recorder::new();
    let async_var = engine.new_variable();
    let sync_var = engine.new_variable();

    {
        let rec = rec.clone();
        engine.push_async(
            move |_ctx, done| {
                let rec = rec.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(150));
                    rec.mark("async-done");
                    done.notify();
                });
            },
            Context::cpu(),
            &[],
            &[async_var],
            OpProperty::Async,
            0,
        );
    }
    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| rec.mark("sync-done"),
            Context::cpu(),
            &[],
            &[sync_var],
            OpProperty::Normal,
            0,
        );
    }

    // The single worker is free while the async body's completion is pending.
    engine.wait_for_var(sync_var).unwrap();
    assert_eq!(rec.labels(), ["sync-done"]);

    engine.wait_for_var(async_var).unwrap();
    assert_eq!(rec.labels(), ["sync-done", "async-done"]);
}

#[test]
fn higher_priority_ready_work_runs_first() {
    let engine = pooled_engine(1);
    let rec = Recorder::new();
    let (ready_tx, ready_rx) = flume::unbounded::<()>();
    let (gate_tx, gate_rx) = flume::unbounded::<()>();

    let gate_var = engine.new_variable();
    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| {
                rec.mark("gate");
                let _ = ready_tx.send(());
                let _ = gate_rx.recv();
            },
            Context::cpu(),
            &[],
            &[gate_var],
            OpProperty::Normal,
            0,
        );
    }
    ready_rx.recv().unwrap();

    // Ready work piles up behind the occupied worker.
    for i in 0..3 {
        let rec = rec.clone();
        let var = engine.new_variable();
        engine.push_sync(
            move |_| rec.mark(format!("low-{i}")),
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }
    {
        let rec = rec.clone();
        let var = engine.new_variable();
        engine.push_sync(
            move |_| rec.mark("high"),
            Context::cpu(),
            &[],
            &[var],
            OpProperty::Normal,
            10,
        );
    }

    gate_tx.send(()).unwrap();
    engine.wait_for_all().unwrap();
    // Highest priority first, then push order among equals.
    assert_eq!(rec.labels(), ["gate", "high", "low-0", "low-1", "low-2"]);
}

#[test]
fn copy_lane_keeps_compute_workers_free() {
    let engine = pooled_engine(1);
    let rec = Recorder::new();
    let copy_var = engine.new_variable();
    let cpu_var = engine.new_variable();

    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| {
                std::thread::sleep(Duration::from_millis(200));
                rec.mark("copy-done");
            },
            Context::device(0),
            &[],
            &[copy_var],
            OpProperty::CopyToDevice,
            0,
        );
    }
    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| rec.mark("cpu-done"),
            Context::cpu(),
            &[],
            &[cpu_var],
            OpProperty::Normal,
            0,
        );
    }

    engine.wait_for_var(cpu_var).unwrap();
    assert_eq!(rec.labels(), ["cpu-done"]);
    assert!(engine.pending_ops() >= 1, "copy should still be in flight");

    engine.wait_for_all().unwrap();
    assert_eq!(rec.labels(), ["cpu-done", "copy-done"]);
}

#[test]
fn device_lanes_serialize_per_device_and_overlap_across_devices() {
    let engine = pooled_engine(2);
    let dev0 = PeakGauge::new();
    let overall = PeakGauge::new();

    for _ in 0..2 {
        let dev0 = dev0.clone();
        let overall = overall.clone();
        let var = engine.new_variable();
        engine.push_sync(
            move |_| {
                dev0.enter();
                overall.enter();
                std::thread::sleep(Duration::from_millis(60));
                overall.exit();
                dev0.exit();
            },
            Context::device(0),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }
    {
        let overall = overall.clone();
        let var = engine.new_variable();
        engine.push_sync(
            move |_| {
                overall.enter();
                std::thread::sleep(Duration::from_millis(60));
                overall.exit();
            },
            Context::device(1),
            &[],
            &[var],
            OpProperty::Normal,
            0,
        );
    }

    engine.wait_for_all().unwrap();
    assert_eq!(dev0.peak(), 1, "one stream per device serializes its lane");
    assert!(overall.peak() >= 2, "distinct devices should overlap");
}

#[test]
fn wait_for_var_waits_for_in_flight_reads() {
    let engine = pooled_engine(2);
    let rec = Recorder::new();
    let var = engine.new_variable();
    let (ready_tx, ready_rx) = flume::unbounded::<()>();

    {
        let rec = rec.clone();
        engine.push_sync(
            move |_| {
                let _ = ready_tx.send(());
                std::thread::sleep(Duration::from_millis(200));
                rec.mark("read-done");
            },
            Context::cpu(),
            &[var],
            &[],
            OpProperty::Normal,
            0,
        );
    }

    // The read is running; the wait must not slip in beside it.
    ready_rx.recv().unwrap();
    engine.wait_for_var(var).unwrap();
    assert_eq!(rec.labels(), ["read-done"]);
    // The wait itself is not a write.
    assert_eq!(engine.var_version(var), 0);
}

#[test]
fn wait_for_var_ignores_unrelated_pending_work() {
    let engine = pooled_engine(2);
    let slow_var = engine.new_variable();
    let quick_var = engine.new_variable();

    engine.push_sync(
        |_| std::thread::sleep(Duration::from_millis(300)),
        Context::cpu(),
        &[],
        &[slow_var],
        OpProperty::Normal,
        0,
    );
    engine.push_sync(
        |_| {},
        Context::cpu(),
        &[],
        &[quick_var],
        OpProperty::Normal,
        0,
    );

    engine.wait_for_var(quick_var).unwrap();
    assert!(engine.pending_ops() >= 1, "slow op should still be running");
    engine.wait_for_all().unwrap();
    assert_eq!(engine.pending_ops(), 0);
}

fn run_diamond(engine: &Engine) -> u64 {
    let a_cell = Arc::new(parking_lot::Mutex::new(0u64));
    let b_cell = Arc::new(parking_lot::Mutex::new(0u64));
    let c_cell = Arc::new(parking_lot::Mutex::new(0u64));
    let d_cell = Arc::new(parking_lot::Mutex::new(0u64));
    let va = engine.new_variable();
    let vb = engine.new_variable();
    let vc = engine.new_variable();
    let vd = engine.new_variable();

    {
        let a = Arc::clone(&a_cell);
        engine.push_sync(
            move |_| *a.lock() = 2,
            Context::cpu(),
            &[],
            &[va],
            OpProperty::Normal,
            0,
        );
    }
    {
        let a = Arc::clone(&a_cell);
        let b = Arc::clone(&b_cell);
        engine.push_sync(
            move |_| *b.lock() = *a.lock() + 1,
            Context::cpu(),
            &[va],
            &[vb],
            OpProperty::Normal,
            0,
        );
    }
    {
        let a = Arc::clone(&a_cell);
        let c = Arc::clone(&c_cell);
        engine.push_sync(
            move |_| *c.lock() = *a.lock() * 3,
            Context::cpu(),
            &[va],
            &[vc],
            OpProperty::Normal,
            0,
        );
    }
    {
        let b = Arc::clone(&b_cell);
        let c = Arc::clone(&c_cell);
        let d = Arc::clone(&d_cell);
        engine.push_sync(
            move |_| *d.lock() = *b.lock() + *c.lock(),
            Context::cpu(),
            &[vb, vc],
            &[vd],
            OpProperty::Normal,
            0,
        );
    }

    engine.wait_for_var(vd).unwrap();
    let result = *d_cell.lock();
    result
}

#[test]
fn diamond_dag_is_deterministic_across_backends() {
    let inline = run_diamond(&inline_engine());
    let pooled = run_diamond(&pooled_engine(8));
    assert_eq!(inline, 9);
    assert_eq!(pooled, 9);
}
