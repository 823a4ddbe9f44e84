//! Performance monitoring.
//!
//! A [`Sampler`] reads the kernel's counters and reports what changed since
//! its previous sample: cycles per core and per class, CPU cycles per process,
//! and requests and busy time per device channel. Counters are read with
//! relaxed atomics while the kernel keeps running, so a sample may mix values
//! a few cycles apart.
//!
//! A [`MonitoringService`] runs a sampler on a background thread at a fixed
//! real-time interval, independent of the tick rate, and hands every sample to
//! its subscribers.

use crate::{
    Kernel,
    cpu::CoreSnapshot,
    dev::{DeviceId, io::ChannelSnapshot},
    process::{CoreId, Pid, ProcessState},
    sync::{SpinLock, atomic::AtomicBool},
};
use core::time::Duration;
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    collections::BTreeMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

/// Cycles a core spent in each class during a sample interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreDelta {
    /// Ticks.
    pub total: u64,
    /// User cycles.
    pub user: u64,
    /// Syscall cycles.
    pub syscall: u64,
    /// Interrupt cycles.
    pub interrupt: u64,
    /// Idle cycles.
    pub idle: u64,
    /// Micro-op sequences completed, instructions and interrupt service
    /// routines alike.
    pub instructions: u64,
}

impl CoreDelta {
    fn between(before: &CoreSnapshot, after: &CoreSnapshot) -> Self {
        Self {
            total: after.total.saturating_sub(before.total),
            user: after.user.saturating_sub(before.user),
            syscall: after.syscall.saturating_sub(before.syscall),
            interrupt: after.interrupt.saturating_sub(before.interrupt),
            idle: after.idle.saturating_sub(before.idle),
            instructions: after
                .instructions_fetched
                .saturating_sub(before.instructions_fetched),
        }
    }

    fn accumulate(&mut self, other: &CoreDelta) {
        self.total += other.total;
        self.user += other.user;
        self.syscall += other.syscall;
        self.interrupt += other.interrupt;
        self.idle += other.idle;
        self.instructions += other.instructions;
    }

    /// Share of the ticks spent on user and syscall cycles.
    pub fn busy_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.user + self.syscall) as f64 / self.total as f64
        }
    }
}

/// Activity of a process during a sample interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDelta {
    /// Process id.
    pub pid: Pid,
    /// Process name.
    pub name: String,
    /// State when sampled.
    pub state: ProcessState,
    /// CPU cycles consumed during the interval.
    pub cpu_cycles: u64,
    /// Cumulative CPU cycles.
    pub total_cpu_cycles: u64,
}

/// Activity of a device channel during a sample interval.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelDelta {
    /// Device id.
    pub device: DeviceId,
    /// Device name.
    pub name: String,
    /// Channel index.
    pub channel: usize,
    /// Requests started.
    pub started: u64,
    /// Requests completed.
    pub completed: u64,
    /// Time spent serving requests.
    pub busy: Duration,
    /// `busy / interval`, at most one.
    pub utilization: f64,
}

/// A monitoring sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Kernel cycle at which the sample was taken.
    pub cycle: u64,
    /// Real time covered by the sample.
    pub interval: Duration,
    /// Per-core deltas, indexed by core id.
    pub cores: Vec<CoreDelta>,
    /// Sum of the per-core deltas.
    pub total: CoreDelta,
    /// Per-process deltas, ordered by pid.
    pub processes: Vec<ProcessDelta>,
    /// Per-channel deltas, ordered by device and channel.
    pub channels: Vec<ChannelDelta>,
}

impl Sample {
    /// Delta of `core`.
    pub fn core(&self, core: CoreId) -> Option<&CoreDelta> {
        self.cores.get(core)
    }

    /// Delta of process `pid`.
    pub fn process(&self, pid: Pid) -> Option<&ProcessDelta> {
        self.processes.iter().find(|p| p.pid == pid)
    }
}

/// Computes samples from the counters of a kernel.
pub struct Sampler {
    kernel: Arc<Kernel>,
    taken_at: Instant,
    cores: Vec<CoreSnapshot>,
    processes: BTreeMap<Pid, u64>,
    channels: BTreeMap<(DeviceId, usize), ChannelSnapshot>,
}

impl Sampler {
    /// Creates a sampler whose first sample covers the time since now.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        let mut sampler = Self {
            cores: kernel.core_counters(),
            kernel,
            taken_at: Instant::now(),
            processes: BTreeMap::new(),
            channels: BTreeMap::new(),
        };
        sampler.processes = sampler.process_cycles();
        sampler.channels = sampler.channel_stats();
        sampler
    }

    fn process_cycles(&self) -> BTreeMap<Pid, u64> {
        self.kernel
            .process_ids()
            .into_iter()
            .filter_map(|pid| self.kernel.process(pid).ok())
            .map(|pcb| (pcb.pid, pcb.cpu_cycles()))
            .collect()
    }

    fn channel_stats(&self) -> BTreeMap<(DeviceId, usize), ChannelSnapshot> {
        self.kernel
            .devices()
            .iter()
            .flat_map(|device| {
                let id = device.id();
                device
                    .channel_stats()
                    .into_iter()
                    .enumerate()
                    .map(move |(channel, stats)| ((id, channel), stats))
            })
            .collect()
    }

    /// Takes a sample.
    pub fn sample(&mut self) -> Sample {
        let now = Instant::now();
        let interval = now.duration_since(self.taken_at);
        self.taken_at = now;

        let cores_now = self.kernel.core_counters();
        let cores: Vec<CoreDelta> = cores_now
            .iter()
            .zip(self.cores.iter())
            .map(|(after, before)| CoreDelta::between(before, after))
            .collect();
        let mut total = CoreDelta::default();
        for delta in &cores {
            total.accumulate(delta);
        }
        self.cores = cores_now;

        let mut processes = Vec::new();
        let mut cycles_now = BTreeMap::new();
        for pid in self.kernel.process_ids() {
            let Ok(pcb) = self.kernel.process(pid) else {
                continue;
            };
            let cycles = pcb.cpu_cycles();
            let before = self.processes.get(&pid).copied().unwrap_or(0);
            processes.push(ProcessDelta {
                pid,
                name: pcb.name.clone(),
                state: pcb.state(),
                cpu_cycles: cycles.saturating_sub(before),
                total_cpu_cycles: cycles,
            });
            cycles_now.insert(pid, cycles);
        }
        self.processes = cycles_now;

        let mut channels = Vec::new();
        let mut channels_now = BTreeMap::new();
        for device in self.kernel.devices() {
            for (channel, after) in device.channel_stats().into_iter().enumerate() {
                let key = (device.id(), channel);
                let before = self.channels.get(&key).copied().unwrap_or_default();
                let busy = after.busy.saturating_sub(before.busy);
                let utilization = if interval.is_zero() {
                    0.0
                } else {
                    (busy.as_secs_f64() / interval.as_secs_f64()).min(1.0)
                };
                channels.push(ChannelDelta {
                    device: device.id(),
                    name: device.name().to_owned(),
                    channel,
                    started: after.started.saturating_sub(before.started),
                    completed: after.completed.saturating_sub(before.completed),
                    busy,
                    utilization,
                });
                channels_now.insert(key, after);
            }
        }
        self.channels = channels_now;

        Sample {
            cycle: self.kernel.cycles(),
            interval,
            cores,
            total,
            processes,
            channels,
        }
    }
}

type Subscriber = Arc<dyn Fn(&Sample) + Send + Sync>;

struct Shared {
    stopped: AtomicBool,
    // Held while a sample is taken and delivered.
    sampling: SpinLock<()>,
    latest: SpinLock<Option<Sample>>,
    subscribers: SpinLock<Vec<Subscriber>>,
}

/// Stops a [`MonitoringService`] without owning it.
///
/// The kernel keeps one per service so that shutting it down also stops
/// monitoring.
pub(crate) struct MonitorHandle {
    shared: Arc<Shared>,
    unparker: Unparker,
}

impl MonitorHandle {
    /// Stops sampling. Returns once no sample is being taken or delivered.
    pub(crate) fn halt(&self) {
        self.shared.stopped.store(true);
        self.unparker.unpark();
        self.shared.sampling.lock().unlock();
    }
}

/// Samples a kernel periodically on a background thread.
pub struct MonitoringService {
    shared: Arc<Shared>,
    unparker: Unparker,
    handle: Option<JoinHandle<()>>,
}

impl MonitoringService {
    /// Starts sampling `kernel` every `interval`.
    ///
    /// The service stops on its own when the kernel shuts down. Subscribers
    /// run on the sampling thread and must not shut the kernel down.
    pub fn start(kernel: Arc<Kernel>, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            sampling: SpinLock::new(()),
            latest: SpinLock::new(None),
            subscribers: SpinLock::new(Vec::new()),
        });
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        kernel.attach_monitor(MonitorHandle {
            shared: shared.clone(),
            unparker: unparker.clone(),
        });
        let state = shared.clone();
        let handle = thread::spawn(move || {
            let mut sampler = Sampler::new(kernel);
            loop {
                parker.park_timeout(interval);
                let guard = state.sampling.lock();
                if state.stopped.load() {
                    guard.unlock();
                    break;
                }
                let sample = sampler.sample();
                let subscribers = state.subscribers.with(|s| s.clone());
                for subscriber in subscribers {
                    subscriber(&sample);
                }
                state.latest.with(|latest| *latest = Some(sample));
                guard.unlock();
            }
        });
        log::info!("Monitor: sampling every {:?}.", interval);
        Self {
            shared,
            unparker,
            handle: Some(handle),
        }
    }

    /// Calls `callback` with every future sample.
    pub fn subscribe(&self, callback: impl Fn(&Sample) + Send + Sync + 'static) {
        self.shared
            .subscribers
            .with(|subscribers| subscribers.push(Arc::new(callback)));
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<Sample> {
        self.shared.latest.with(|latest| latest.clone())
    }

    /// Stops sampling.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shared.stopped.store(true);
        self.unparker.unpark();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Monitor: a subscriber panicked.");
            }
        }
    }
}

impl Drop for MonitoringService {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_ratio() {
        let delta = CoreDelta {
            total: 10,
            user: 4,
            syscall: 1,
            idle: 5,
            ..Default::default()
        };
        assert_eq!(delta.busy_ratio(), 0.5);
        assert_eq!(CoreDelta::default().busy_ratio(), 0.0);
    }

    #[test]
    fn core_deltas_accumulate() {
        let before = CoreSnapshot {
            total: 5,
            idle: 5,
            ..Default::default()
        };
        let after = CoreSnapshot {
            total: 12,
            idle: 6,
            user: 6,
            instructions_fetched: 2,
            ..Default::default()
        };
        let delta = CoreDelta::between(&before, &after);
        assert_eq!(delta.total, 7);
        assert_eq!(delta.user, 6);
        assert_eq!(delta.idle, 1);
        assert_eq!(delta.instructions, 2);
        let mut total = CoreDelta::default();
        total.accumulate(&delta);
        total.accumulate(&delta);
        assert_eq!(total.total, 14);
    }
}
