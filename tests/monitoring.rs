//! Performance monitoring of a running kernel.

mod common;

use common::{all_terminated, io_bound, kernel, run_until, spinner};
use std::{thread, time::Duration, time::Instant};
use vmkernel::{
    clock::Ticker,
    monitor::{MonitoringService, Sampler},
    sync::atomic::AtomicUsize,
    thread::SchedulerKind,
};

/// Tests sampled deltas.
///
/// This test ensures that:
/// - Each sample reports the cycles elapsed since the previous one, per core
///   and summed over cores.
/// - Per-process CPU cycles are reported as deltas next to their totals.
/// - A sample taken without ticking reports no activity.
#[test]
fn samples_report_deltas() {
    let kernel = kernel(2, 5, SchedulerKind::RoundRobin);
    let mut sampler = Sampler::new(kernel.clone());
    let pid = kernel.create_process(spinner("spin"), 10).unwrap();

    kernel.run(100).unwrap();
    let first = sampler.sample();
    assert_eq!(first.cycle, 100);
    assert_eq!(first.cores.len(), 2);
    for core in &first.cores {
        assert_eq!(core.total, 100);
        assert_eq!(
            core.user + core.syscall + core.interrupt + core.idle,
            core.total
        );
    }
    assert_eq!(first.total.total, 200);
    let spin = first.process(pid).unwrap();
    assert!(spin.cpu_cycles > 0);
    assert_eq!(spin.cpu_cycles, spin.total_cpu_cycles);
    assert!(first.total.busy_ratio() > 0.0);

    kernel.run(50).unwrap();
    let second = sampler.sample();
    assert_eq!(second.core(1).unwrap().total, 50);
    let spin = second.process(pid).unwrap();
    assert_eq!(
        spin.total_cpu_cycles,
        kernel.process(pid).unwrap().cpu_cycles()
    );
    assert!(spin.cpu_cycles <= spin.total_cpu_cycles);

    let idle = sampler.sample();
    assert_eq!(idle.total.total, 0);
    assert_eq!(idle.process(pid).unwrap().cpu_cycles, 0);
}

/// Tests channel statistics.
///
/// This test ensures that:
/// - Every request served by a device shows up once in the channel deltas.
/// - Utilization never exceeds one.
#[test]
fn samples_report_channel_activity() {
    let kernel = kernel(1, 5, SchedulerKind::Priority);
    let disk = kernel.register_device("disk", 5, 2).unwrap();
    let mut sampler = Sampler::new(kernel.clone());
    let pids = [
        kernel.create_process(io_bound("a", disk, 3, 1), 10).unwrap(),
        kernel.create_process(io_bound("b", disk, 2, 1), 10).unwrap(),
    ];

    run_until(&kernel, Duration::from_secs(10), || {
        all_terminated(&kernel, &pids)
    });

    let sample = sampler.sample();
    assert_eq!(sample.channels.len(), 2);
    let started: u64 = sample.channels.iter().map(|c| c.started).sum();
    assert_eq!(started, 5);
    for channel in &sample.channels {
        assert_eq!(channel.device, disk);
        assert_eq!(channel.name, "disk");
        assert!((0.0..=1.0).contains(&channel.utilization));
    }
    assert!(sample.channels.iter().any(|c| !c.busy.is_zero()));
}

/// Tests the monitoring service.
///
/// This test ensures that:
/// - The service samples periodically while the kernel runs on another
///   thread, and notifies subscribers of every sample.
/// - The latest sample stays available until the service stops.
#[test]
fn service_publishes_samples() {
    let kernel = kernel(2, 5, SchedulerKind::RoundRobin);
    kernel.create_process(spinner("spin"), 10).unwrap();
    let service = MonitoringService::start(kernel.clone(), Duration::from_millis(5));
    let delivered = std::sync::Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    service.subscribe(move |sample| {
        assert_eq!(sample.cores.len(), 2);
        counter.increment();
    });
    let ticker = Ticker::spawn(kernel.clone(), Duration::ZERO);

    let deadline = Instant::now() + Duration::from_secs(5);
    while delivered.load() < 3 {
        assert!(Instant::now() < deadline, "no samples delivered");
        thread::sleep(Duration::from_millis(1));
    }
    let ticks = ticker.stop().unwrap();
    let latest = service.latest().unwrap();
    assert!(latest.cycle <= ticks);
    assert!(latest.interval > Duration::ZERO);
    service.stop();
}

/// Tests kernel shutdown with monitoring attached.
///
/// This test ensures that:
/// - Shutting the kernel down stops its monitoring services: no sample is
///   delivered once `shutdown` returns.
/// - A service started after shutdown never samples.
#[test]
fn shutdown_stops_monitoring() {
    let kernel = kernel(1, 5, SchedulerKind::RoundRobin);
    let service = kernel.start_monitoring(Duration::from_millis(2));
    let delivered = std::sync::Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    service.subscribe(move |_| counter.increment());

    let deadline = Instant::now() + Duration::from_secs(5);
    while delivered.load() == 0 {
        assert!(Instant::now() < deadline, "no samples delivered");
        thread::sleep(Duration::from_millis(1));
    }
    kernel.shutdown();
    assert!(kernel.is_shut_down());
    let at_shutdown = delivered.load();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(delivered.load(), at_shutdown);
    assert!(service.latest().is_some());

    let late = kernel.start_monitoring(Duration::from_millis(2));
    thread::sleep(Duration::from_millis(20));
    assert!(late.latest().is_none());
    late.stop();
    service.stop();
}
