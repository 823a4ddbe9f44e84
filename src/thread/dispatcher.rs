//! Context switching.
//!
//! The [`Dispatcher`] moves register state between a core and the process
//! control blocks. While a process runs, its registers live in the [`Cpu`];
//! the dispatcher writes them back into the outgoing PCB and loads the
//! incoming PCB's saved [`Context`] into the core.
//!
//! Switching only ever happens on the tick thread, inside the tick of the
//! owning core, so no lock is held across a switch.
//!
//! [`Context`]: crate::process::Context

use crate::{
    cpu::Cpu,
    process::{Pcb, ProcessState},
};
use std::sync::Arc;

/// Installs processes on cores.
pub struct Dispatcher;

impl Dispatcher {
    /// Switches `cpu` to `next` at cycle `now`.
    ///
    /// If `next` already runs on `cpu`, only its dispatch accounting is
    /// refreshed.
    pub fn switch_context(cpu: &mut Cpu, next: Arc<Pcb>, now: u64) {
        next.stamp_dispatch(now);
        if Arc::ptr_eq(cpu.current(), &next) {
            return;
        }
        let context = next.context();
        next.transition_unless_terminated(ProcessState::Running);
        let (previous, saved) = cpu.swap_current(next, context);
        previous.save_context(saved);
        // Only an idle process leaves the core still marked running.
        if previous.state() == ProcessState::Running {
            previous.set_state(ProcessState::Ready);
        }
        log::debug!(
            "Dispatcher: core {} switches from pid {} to pid {}.",
            cpu.core_id(),
            previous.pid,
            cpu.current().pid
        );
    }
}
