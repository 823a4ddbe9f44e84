//! Process scheduler.

use crate::{
    KernelError,
    clock::CycleCounter,
    process::{CoreId, Pcb},
    thread::{priority::Priority, round_robin::RoundRobin},
};
use core::{fmt, str::FromStr};
use std::sync::Arc;

/// A trait for a process scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// process scheduler. A scheduler owns the ready processes, decides which of
/// them runs next on a core, and keeps one idle process per core to fall back
/// to when nothing is ready.
///
/// A scheduler is shared by every core and by the threads creating processes,
/// so implementations guard their ready structure with a lock.
///
/// This trait can be implemented by different types of schedulers, such as
/// [`RoundRobin`] or [`Priority`]. Each implementation may have a unique
/// strategy for ordering the ready processes.
pub trait Scheduler: Send + Sync {
    /// Push a process `pcb` into the ready structure.
    ///
    /// The process becomes [`Ready`]. A [`Terminated`] process is silently
    /// ignored: termination may race with a pending I/O completion.
    ///
    /// [`Ready`]: crate::process::ProcessState::Ready
    /// [`Terminated`]: crate::process::ProcessState::Terminated
    fn admit(&self, pcb: Arc<Pcb>);

    /// Select the next process to run on `core`, whose current process is
    /// `previous`.
    ///
    /// Never fails: with nothing ready, the idle process of `core` is
    /// returned. The selected process becomes [`Running`].
    ///
    /// [`Running`]: crate::process::ProcessState::Running
    fn preempt(&self, core: CoreId, previous: &Arc<Pcb>) -> Arc<Pcb>;

    /// The idle process of `core`.
    fn idle(&self, core: CoreId) -> Arc<Pcb>;

    /// Number of processes in the ready structure.
    fn ready_len(&self) -> usize;
}

/// The scheduling policies available to a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    /// First-in first-out time slicing.
    RoundRobin,
    /// Static priorities with aging.
    Priority,
}

impl SchedulerKind {
    /// Builds a scheduler of this kind.
    ///
    /// `idles[core]` is the idle process of `core`. `cycles` is the global
    /// cycle counter used for aging.
    pub fn build(self, idles: Vec<Arc<Pcb>>, cycles: CycleCounter) -> Arc<dyn Scheduler> {
        match self {
            SchedulerKind::RoundRobin => Arc::new(RoundRobin::new(idles, cycles)),
            SchedulerKind::Priority => Arc::new(Priority::new(idles, cycles)),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::RoundRobin => write!(f, "round_robin"),
            SchedulerKind::Priority => write!(f, "priority"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(SchedulerKind::RoundRobin),
            "priority" => Ok(SchedulerKind::Priority),
            _ => Err(KernelError::UnknownScheduler(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scheduler_kind() {
        assert_eq!("rr".parse(), Ok(SchedulerKind::RoundRobin));
        assert_eq!("Round_Robin".parse(), Ok(SchedulerKind::RoundRobin));
        assert_eq!("priority".parse(), Ok(SchedulerKind::Priority));
        assert_eq!(
            "fifo".parse::<SchedulerKind>(),
            Err(KernelError::UnknownScheduler("fifo".into()))
        );
        assert_eq!(
            SchedulerKind::RoundRobin.to_string().parse(),
            Ok(SchedulerKind::RoundRobin)
        );
    }
}
