//! Asynchronous I/O devices.
//!
//! An [`IoDevice`] serves requests on `channels` independent channels. Each
//! channel is a worker thread that pulls the oldest request from the device's
//! request queue, sleeps for the simulated latency, posts the requesting
//! process to the waiter queue and raises the device's completion vector as an
//! external interrupt. The kernel drains the waiter queue when it services
//! that interrupt.
//!
//! Latency is expressed in *device ticks*: a request of `units` operation
//! units takes `units × base_latency` device ticks, each lasting the
//! configured tick duration in real time. Device time is therefore
//! independent of the kernel's cycle counter.
//!
//! Idle workers park and are woken by [`IoDevice::submit`]. Both queues are
//! lock-free, so submitting never blocks the tick thread.

use super::DeviceId;
use crate::{
    interrupt::{InterruptController, Vector},
    process::{Pcb, ProcessState},
    sync::{
        SpinLock,
        atomic::{AtomicBool, AtomicU64},
    },
};
use core::time::Duration;
use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

/// An I/O request.
#[derive(Debug)]
pub struct IoRequest {
    /// The process blocked on this request.
    pub pcb: Arc<Pcb>,
    /// Operation units to perform.
    pub units: u64,
}

/// Statistics of one channel.
///
/// Written only by the channel's worker; read without synchronization by the
/// monitor.
#[derive(Default, Debug)]
struct ChannelStats {
    started: AtomicU64,
    completed: AtomicU64,
    busy_nanos: AtomicU64,
    /// Nanoseconds since the device epoch at which the request in flight
    /// started, plus one. Zero while the channel is idle.
    in_flight_since: AtomicU64,
}

/// A point-in-time view of a channel's statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Requests the channel started serving.
    pub started: u64,
    /// Requests the channel completed.
    pub completed: u64,
    /// Time spent serving requests, including the request in flight.
    pub busy: Duration,
}

struct Shared {
    vector: Vector,
    unit_latency: Duration,
    requests: SegQueue<IoRequest>,
    waiters: SegQueue<Arc<Pcb>>,
    stats: Vec<ChannelStats>,
    stopped: AtomicBool,
    epoch: Instant,
    controller: Arc<InterruptController>,
}

impl Shared {
    fn nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn latency(&self, units: u64) -> Duration {
        let nanos = self.unit_latency.as_nanos().saturating_mul(units as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn serve(&self, channel: usize, request: IoRequest) {
        let stats = &self.stats[channel];
        let begin = self.nanos();
        stats.started.increment();
        stats.in_flight_since.store(begin + 1);

        thread::sleep(self.latency(request.units));

        stats.busy_nanos.fetch_add(self.nanos().saturating_sub(begin));
        stats.in_flight_since.store(0);

        log::trace!(
            "Devices: channel {} completed {} unit(s) for pid {}.",
            channel,
            request.units,
            request.pcb.pid
        );
        self.waiters.push(request.pcb);
        self.controller.raise_external(self.vector);
        stats.completed.increment();
    }

    fn work(&self, channel: usize, parker: Parker) {
        while !self.stopped.load() {
            match self.requests.pop() {
                Some(request) => self.serve(channel, request),
                None => parker.park(),
            }
        }
    }
}

/// An asynchronous multi-channel I/O device.
pub struct IoDevice {
    id: DeviceId,
    name: String,
    base_latency: u64,
    shared: Arc<Shared>,
    unparkers: Vec<Unparker>,
    workers: SpinLock<Vec<JoinHandle<()>>>,
}

impl IoDevice {
    /// Creates a device and starts one worker per channel.
    pub(crate) fn new(
        id: DeviceId,
        name: &str,
        vector: Vector,
        base_latency: u64,
        channels: usize,
        tick_duration: Duration,
        controller: Arc<InterruptController>,
    ) -> Self {
        let unit_latency = Duration::from_nanos(u64::try_from(
            tick_duration
                .as_nanos()
                .saturating_mul(base_latency as u128),
        )
        .unwrap_or(u64::MAX));
        let shared = Arc::new(Shared {
            vector,
            unit_latency,
            requests: SegQueue::new(),
            waiters: SegQueue::new(),
            stats: (0..channels).map(|_| ChannelStats::default()).collect(),
            stopped: AtomicBool::new(false),
            epoch: Instant::now(),
            controller,
        });
        let mut unparkers = Vec::with_capacity(channels);
        let mut workers = Vec::with_capacity(channels);
        for channel in 0..channels {
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            let shared = shared.clone();
            workers.push(thread::spawn(move || shared.work(channel, parker)));
        }
        Self {
            id,
            name: name.to_owned(),
            base_latency,
            shared,
            unparkers,
            workers: SpinLock::new(workers),
        }
    }

    /// Device id.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completion vector.
    pub fn vector(&self) -> Vector {
        self.shared.vector
    }

    /// Device ticks per operation unit.
    pub fn base_latency(&self) -> u64 {
        self.base_latency
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.shared.stats.len()
    }

    /// Blocks `pcb` on a request of `units` operation units.
    ///
    /// A terminated process is not queued.
    pub fn submit(&self, pcb: Arc<Pcb>, units: u64) {
        if !pcb.transition_unless_terminated(ProcessState::Waiting) {
            log::warn!(
                "Devices: pid {} terminated before its request to {}.",
                pcb.pid,
                self.name
            );
            return;
        }
        self.shared.requests.push(IoRequest { pcb, units });
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }

    /// Takes every process whose request completed.
    pub fn pop_waiters(&self) -> Vec<Arc<Pcb>> {
        core::iter::from_fn(|| self.shared.waiters.pop()).collect()
    }

    /// Number of requests not yet picked up by a channel.
    pub fn queued(&self) -> usize {
        self.shared.requests.len()
    }

    /// Statistics of every channel.
    pub fn channel_stats(&self) -> Vec<ChannelSnapshot> {
        let now = self.shared.nanos();
        self.shared
            .stats
            .iter()
            .map(|stats| {
                let in_flight = match stats.in_flight_since.load() {
                    0 => 0,
                    since => now.saturating_sub(since - 1),
                };
                ChannelSnapshot {
                    started: stats.started.load(),
                    completed: stats.completed.load(),
                    busy: Duration::from_nanos(stats.busy_nanos.load() + in_flight),
                }
            })
            .collect()
    }

    /// Total requests completed by all channels.
    pub fn completed(&self) -> u64 {
        self.shared.stats.iter().map(|s| s.completed.load()).sum()
    }

    /// Stops the workers once their request in flight completes.
    ///
    /// Queued requests are abandoned. Calling this again has no effect.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true) {
            return;
        }
        for unparker in &self.unparkers {
            unparker.unpark();
        }
        let workers = self.workers.with(core::mem::take);
        for worker in workers {
            if worker.join().is_err() {
                log::warn!("Devices: a worker of {} panicked.", self.name);
            }
        }
        log::debug!("Devices: {} stopped.", self.name);
    }
}

impl Drop for IoDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
