//! # Round-Robin Scheduling.
//!
//! Round-Robin scheduling is a preemptive scheduling algorithm that assigns
//! each process a fixed time slice (or quantum) in a circular order. Once a
//! process's time slice expires, the timer of its core fires, the process is
//! pushed back to the end of the ready queue, and the process at the front of
//! the queue gets to run. This guarantees that every process receives a fair
//! share of CPU time: with `N` processes ready and a quantum of `Q` ticks,
//! each of them runs at least once within `N × Q` ticks.
//!
//! ## Shared run queue
//!
//! All cores share a single run queue, protected by a [`SpinLock`]. A process
//! therefore never needs to be migrated between cores: whichever core is
//! preempted next takes the oldest ready process.
//!
//! ```rust,ignore
//! pub struct RoundRobin {
//!     /// Processes ready to run, oldest first.
//!     run_queue: SpinLock<VecDeque<Arc<Pcb>>>,
//!     /// The idle process of each core.
//!     idles: Vec<Arc<Pcb>>,
//!     ...
//! }
//! ```
//!
//! ## Preemption
//!
//! [`RoundRobin::preempt`] first pushes the preempted process back to the
//! queue and only then pops the next one. With a single ready process, that
//! process is simply re-selected; with more, it goes behind every process that
//! was already waiting. Processes that terminated while queued are dropped
//! when they reach the front. When the queue is empty the core runs its idle
//! process, which is never queued.
//!
//! [`RoundRobin::preempt`]: crate::thread::Scheduler::preempt

use crate::{
    clock::CycleCounter,
    process::{CoreId, Pcb, ProcessState},
    sync::SpinLock,
    thread::Scheduler,
};
use std::{collections::VecDeque, sync::Arc};

/// A round-robin scheduler with one run queue shared by all cores.
pub struct RoundRobin {
    run_queue: SpinLock<VecDeque<Arc<Pcb>>>,
    idles: Vec<Arc<Pcb>>,
    cycles: CycleCounter,
}

impl RoundRobin {
    /// Creates a scheduler; `idles[core]` is the idle process of `core`.
    pub fn new(idles: Vec<Arc<Pcb>>, cycles: CycleCounter) -> Self {
        Self {
            run_queue: SpinLock::new(VecDeque::new()),
            idles,
            cycles,
        }
    }

    fn is_idle_of(&self, core: CoreId, pcb: &Arc<Pcb>) -> bool {
        self.idles.get(core).is_some_and(|idle| Arc::ptr_eq(idle, pcb))
    }
}

impl Scheduler for RoundRobin {
    fn admit(&self, pcb: Arc<Pcb>) {
        if pcb.is_idle() {
            return;
        }
        if !pcb.transition_unless_terminated(ProcessState::Ready) {
            log::warn!("Scheduler: ignoring admission of terminated pid {}.", pcb.pid);
            return;
        }
        pcb.stamp_enqueue(self.cycles.now());
        self.run_queue.with(|queue| queue.push_back(pcb));
    }

    fn preempt(&self, core: CoreId, previous: &Arc<Pcb>) -> Arc<Pcb> {
        if previous.state() == ProcessState::Running && !self.is_idle_of(core, previous) {
            self.admit(previous.clone());
        }
        let mut queue = self.run_queue.lock();
        let next = loop {
            match queue.pop_front() {
                Some(pcb) if pcb.is_terminated() => continue,
                Some(pcb) => break Some(pcb),
                None => break None,
            }
        };
        queue.unlock();

        let next = next.unwrap_or_else(|| self.idle(core));
        next.transition_unless_terminated(ProcessState::Running);
        next
    }

    fn idle(&self, core: CoreId) -> Arc<Pcb> {
        self.idles[core].clone()
    }

    fn ready_len(&self) -> usize {
        self.run_queue.with(|queue| queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Context;

    fn scheduler(cores: usize) -> RoundRobin {
        let idles = (0..cores).map(|core| Pcb::idle(core as u64, core)).collect();
        RoundRobin::new(idles, CycleCounter::new())
    }

    fn process(pid: u64) -> Arc<Pcb> {
        Pcb::new(pid, format!("p{pid}"), 10, Context::default(), 0)
    }

    #[test]
    fn empty_queue_falls_back_to_idle() {
        let rr = scheduler(2);
        let idle = rr.idle(1);
        let next = rr.preempt(1, &idle);
        assert!(Arc::ptr_eq(&next, &idle));
        assert_eq!(rr.ready_len(), 0);
    }

    #[test]
    fn previous_is_readmitted_before_selection() {
        let rr = scheduler(1);
        let (a, b) = (process(10), process(11));
        rr.admit(a.clone());
        rr.admit(b.clone());

        let first = rr.preempt(0, &rr.idle(0));
        assert!(Arc::ptr_eq(&first, &a));
        assert_eq!(a.state(), ProcessState::Running);

        let second = rr.preempt(0, &first);
        assert!(Arc::ptr_eq(&second, &b));
        assert_eq!(a.state(), ProcessState::Ready);

        let third = rr.preempt(0, &second);
        assert!(Arc::ptr_eq(&third, &a));
    }

    #[test]
    fn single_process_is_reselected() {
        let rr = scheduler(1);
        let a = process(10);
        rr.admit(a.clone());
        let first = rr.preempt(0, &rr.idle(0));
        let again = rr.preempt(0, &first);
        assert!(Arc::ptr_eq(&again, &a));
        assert_eq!(rr.ready_len(), 0);
    }

    #[test]
    fn terminated_processes_are_never_selected() {
        let rr = scheduler(1);
        let (a, b) = (process(10), process(11));
        rr.admit(a.clone());
        rr.admit(b.clone());
        a.set_state(ProcessState::Terminated);
        let next = rr.preempt(0, &rr.idle(0));
        assert!(Arc::ptr_eq(&next, &b));

        rr.admit(a.clone());
        assert_eq!(rr.ready_len(), 0);
        b.set_state(ProcessState::Terminated);
        let next = rr.preempt(0, &b);
        assert!(next.is_idle());
    }
}
