//! Local timer.
//!
//! Every core has a [`TimerDevice`] registered on the clock right after the
//! core itself. It counts ticks and raises [`Vector::TIMER`] on its core each
//! time `quantum` ticks elapsed. The timer is the only source of preemption.

use crate::{
    KernelError,
    clock::TickListener,
    interrupt::{InterruptController, Vector},
    process::CoreId,
};
use std::sync::Arc;

/// The periodic timer of a core.
pub struct TimerDevice {
    core: CoreId,
    quantum: u64,
    elapsed: u64,
    controller: Arc<InterruptController>,
}

impl TimerDevice {
    /// Creates the timer of `core`, firing every `quantum` ticks.
    pub fn new(core: CoreId, quantum: u64, controller: Arc<InterruptController>) -> Self {
        Self {
            core,
            quantum,
            elapsed: 0,
            controller,
        }
    }
}

impl TickListener for TimerDevice {
    fn on_tick(&mut self) -> Result<(), KernelError> {
        self.elapsed += 1;
        if self.elapsed >= self.quantum {
            self.elapsed = 0;
            self.controller.raise_local(Vector::TIMER, self.core)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_every_quantum() {
        let controller = Arc::new(InterruptController::new(2));
        let mut timer = TimerDevice::new(1, 3, controller.clone());
        let mut fired = Vec::new();
        for tick in 1..=9 {
            timer.on_tick().unwrap();
            if controller.fetch_ready(1).is_some() {
                fired.push(tick);
            }
        }
        assert_eq!(fired, vec![3, 6, 9]);
        assert_eq!(controller.pending(0), 0);
    }
}
