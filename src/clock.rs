//! The system clock.
//!
//! A [`Clock`] owns an ordered list of [`TickListener`]s and notifies them in
//! registration order on every tick. The kernel registers, for each core, the
//! core and then its timer, and finally the global [`CycleCounter`]. Listeners
//! of one tick therefore observe the cycle number of that tick.
//!
//! The clock itself has no notion of real time. A [`Ticker`] drives a kernel
//! from a background thread at a fixed real-time period.

use crate::{
    Kernel, KernelError,
    sync::atomic::{AtomicBool, AtomicU64},
};
use core::time::Duration;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

/// A component advanced by the clock.
pub trait TickListener: Send {
    /// Called once per tick.
    fn on_tick(&mut self) -> Result<(), KernelError>;
}

/// Fans out ticks to its listeners.
#[derive(Default)]
pub struct Clock {
    listeners: Vec<Box<dyn TickListener>>,
    ticks: u64,
}

impl Clock {
    /// Creates a clock without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener` to the notification order.
    pub fn register(&mut self, listener: impl TickListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Advances every listener by one tick.
    ///
    /// Stops at the first listener that fails; the tick still counts.
    pub fn tick(&mut self) -> Result<(), KernelError> {
        self.ticks += 1;
        self.listeners
            .iter_mut()
            .try_for_each(|listener| listener.on_tick())
    }

    /// Ticks delivered so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// The global cycle counter.
///
/// Clones share the same counter. The clone registered on the clock advances
/// it; the others read it.
#[derive(Clone, Default, Debug)]
pub struct CycleCounter(Arc<AtomicU64>);

impl CycleCounter {
    /// Creates a counter at cycle zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cycle.
    pub fn now(&self) -> u64 {
        self.0.load()
    }

    /// Moves to the next cycle.
    pub fn advance(&self) {
        self.0.increment()
    }
}

impl TickListener for CycleCounter {
    fn on_tick(&mut self) -> Result<(), KernelError> {
        self.advance();
        Ok(())
    }
}

/// Ticks a kernel from a background thread.
pub struct Ticker {
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64, KernelError>>>,
}

impl Ticker {
    /// Starts ticking `kernel` once per `period`.
    ///
    /// A zero period ticks as fast as possible. The thread exits on the first
    /// failing tick.
    pub fn spawn(kernel: Arc<Kernel>, period: Duration) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let handle = thread::spawn(move || {
            let mut ticks = 0;
            while !flag.load() {
                if let Err(e) = kernel.tick() {
                    log::warn!("Clock: tick {} failed: {}.", ticks, e);
                    return Err(e);
                }
                ticks += 1;
                if !period.is_zero() {
                    thread::sleep(period);
                }
            }
            Ok(ticks)
        });
        Self {
            stopped,
            handle: Some(handle),
        }
    }

    /// Returns `true` once the thread exited, either stopped or failed.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the thread and returns the number of ticks it delivered, or the
    /// error that ended it.
    pub fn stop(mut self) -> Result<u64, KernelError> {
        self.join().unwrap_or(Ok(0))
    }

    fn join(&mut self) -> Option<Result<u64, KernelError>> {
        self.stopped.store(true);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(result) => Some(result),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if !thread::panicking() {
            let _ = self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::atomic::AtomicUsize;

    struct Recorder {
        id: usize,
        log: Arc<crate::sync::SpinLock<Vec<usize>>>,
    }

    impl TickListener for Recorder {
        fn on_tick(&mut self) -> Result<(), KernelError> {
            self.log.with(|log| log.push(self.id));
            Ok(())
        }
    }

    struct Failing(Arc<AtomicUsize>);

    impl TickListener for Failing {
        fn on_tick(&mut self) -> Result<(), KernelError> {
            self.0.increment();
            Err(KernelError::Busy)
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let log = Arc::new(crate::sync::SpinLock::new(Vec::new()));
        let mut clock = Clock::new();
        for id in 0..3 {
            clock.register(Recorder {
                id,
                log: log.clone(),
            });
        }
        clock.tick().unwrap();
        clock.tick().unwrap();
        assert_eq!(log.with(|log| log.clone()), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(clock.ticks(), 2);
    }

    #[test]
    fn failing_listener_stops_the_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = CycleCounter::new();
        let mut clock = Clock::new();
        clock.register(Failing(calls.clone()));
        clock.register(counter.clone());
        assert_eq!(clock.tick(), Err(KernelError::Busy));
        assert_eq!(calls.load(), 1);
        assert_eq!(counter.now(), 0);
    }

    #[test]
    fn cycle_counter_clones_share_state() {
        let counter = CycleCounter::new();
        let mut registered = counter.clone();
        registered.on_tick().unwrap();
        registered.on_tick().unwrap();
        assert_eq!(counter.now(), 2);
    }
}
