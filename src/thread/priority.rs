//! # Priority Scheduling with Aging.
//!
//! The [`Priority`] scheduler always runs the ready process with the highest
//! *dynamic* priority. Every process is created with a static priority in
//! `MIN_PRIORITY..=MAX_PRIORITY`; a larger value is more urgent. The dynamic
//! priority is recomputed each time the process is admitted:
//!
//! ```text
//! boost   = BETA  × (now − last_enqueue_cycle) / AGING_QUANTUM
//! bias    = ALPHA × (io_share − cpu_share)
//! penalty = GAMMA × #(queued processes with dynamic ≥ previous dynamic)
//! dynamic = clamp(round(static + boost + bias − penalty),
//!                 static − PRIORITY_BAND, static + PRIORITY_BAND)
//! ```
//!
//! - **Aging** (`boost`) lifts processes that have not been admitted for a
//!   long time, so that a low-priority process cannot starve.
//! - **I/O bias** (`bias`) favors processes that spend more time blocked on
//!   devices than on a core. `cpu_share = cpu / (cpu + wait + 1)` and
//!   `io_share = wait / (cpu + wait + 1)`, both taken from the cumulative
//!   cycle accounts of the process.
//! - **Queue pressure** (`penalty`) slightly lowers a process that joins a
//!   crowded queue of peers.
//!
//! The static priority is a hard band: the dynamic priority never leaves
//! `static ± PRIORITY_BAND`.
//!
//! The ready processes live in a binary heap keyed by
//! `MIN_PRIORITY + (MAX_PRIORITY − dynamic)`; the smallest key is served
//! first, and processes with equal keys are served in admission order.

use crate::{
    clock::CycleCounter,
    process::{CoreId, MAX_PRIORITY, MIN_PRIORITY, PRIORITY_BAND, Pcb, ProcessState},
    sync::SpinLock,
    thread::Scheduler,
};
use core::cmp::Ordering;
use std::{collections::BinaryHeap, sync::Arc};

/// Weight of the I/O-versus-CPU bias.
pub const ALPHA: f64 = 5.0;
/// Weight of the aging boost.
pub const BETA: f64 = 1.0;
/// Weight of the queue pressure penalty.
pub const GAMMA: f64 = 0.1;
/// Cycles of waiting worth one unit of aging boost (with `BETA = 1`).
pub const AGING_QUANTUM: f64 = 50.0;

/// Inputs of a dynamic priority computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PriorityInputs {
    /// Static priority of the process.
    pub static_priority: i32,
    /// Cycles since the process was last admitted.
    pub waited: u64,
    /// Cycles the process consumed on a core.
    pub cpu_cycles: u64,
    /// Cycles the process spent blocked on I/O.
    pub io_cycles: u64,
    /// Queued processes whose dynamic priority is at least the previous
    /// dynamic priority of the process.
    pub ahead: usize,
}

/// Computes a dynamic priority.
pub fn dynamic_priority(inputs: PriorityInputs) -> i32 {
    let boost = BETA * inputs.waited as f64 / AGING_QUANTUM;
    let total = inputs.cpu_cycles as f64 + inputs.io_cycles as f64 + 1.0;
    let bias = ALPHA * (inputs.io_cycles as f64 / total - inputs.cpu_cycles as f64 / total);
    let penalty = GAMMA * inputs.ahead as f64;
    let raw = inputs.static_priority as f64 + boost + bias - penalty;
    let low = inputs.static_priority - PRIORITY_BAND;
    let high = inputs.static_priority + PRIORITY_BAND;
    raw.round().clamp(low as f64, high as f64) as i32
}

/// Key under which a process of dynamic priority `dynamic` is queued.
pub fn queue_key(dynamic: i32) -> i32 {
    MIN_PRIORITY + (MAX_PRIORITY - dynamic)
}

struct Entry {
    key: i32,
    seq: u64,
    pcb: Arc<Pcb>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // `BinaryHeap` is a max-heap: the smallest (key, seq) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.key, other.seq).cmp(&(self.key, self.seq))
    }
}

struct ReadyHeap {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

/// A priority scheduler with aging.
pub struct Priority {
    ready: SpinLock<ReadyHeap>,
    idles: Vec<Arc<Pcb>>,
    cycles: CycleCounter,
}

impl Priority {
    /// Creates a scheduler; `idles[core]` is the idle process of `core`.
    pub fn new(idles: Vec<Arc<Pcb>>, cycles: CycleCounter) -> Self {
        Self {
            ready: SpinLock::new(ReadyHeap {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            idles,
            cycles,
        }
    }

    fn is_idle_of(&self, core: CoreId, pcb: &Arc<Pcb>) -> bool {
        self.idles.get(core).is_some_and(|idle| Arc::ptr_eq(idle, pcb))
    }
}

impl Scheduler for Priority {
    fn admit(&self, pcb: Arc<Pcb>) {
        if pcb.is_idle() {
            return;
        }
        if !pcb.transition_unless_terminated(ProcessState::Ready) {
            log::warn!("Scheduler: ignoring admission of terminated pid {}.", pcb.pid);
            return;
        }
        let now = self.cycles.now();
        let mut ready = self.ready.lock();
        let previous = pcb.dynamic_priority();
        let ahead = ready
            .heap
            .iter()
            .filter(|entry| entry.pcb.dynamic_priority() >= previous)
            .count();
        let dynamic = dynamic_priority(PriorityInputs {
            static_priority: pcb.static_priority,
            waited: now.saturating_sub(pcb.last_enqueue_cycle()),
            cpu_cycles: pcb.cpu_cycles(),
            io_cycles: pcb.wait_cycles(),
            ahead,
        });
        pcb.set_dynamic_priority(dynamic);
        pcb.stamp_enqueue(now);
        let seq = ready.seq;
        ready.seq += 1;
        ready.heap.push(Entry {
            key: queue_key(dynamic),
            seq,
            pcb,
        });
        ready.unlock();
    }

    fn preempt(&self, core: CoreId, previous: &Arc<Pcb>) -> Arc<Pcb> {
        let keeps_core =
            previous.state() == ProcessState::Running && !self.is_idle_of(core, previous);
        if keeps_core {
            if self.ready_len() == 0 {
                return previous.clone();
            }
            self.admit(previous.clone());
        }
        let mut ready = self.ready.lock();
        let next = loop {
            match ready.heap.pop() {
                Some(entry) if entry.pcb.is_terminated() => continue,
                Some(entry) => break Some(entry.pcb),
                None => break None,
            }
        };
        ready.unlock();

        let next = next.unwrap_or_else(|| self.idle(core));
        next.transition_unless_terminated(ProcessState::Running);
        next
    }

    fn idle(&self, core: CoreId) -> Arc<Pcb> {
        self.idles[core].clone()
    }

    fn ready_len(&self) -> usize {
        self.ready.with(|ready| ready.heap.len())
    }
}
