//! System call infrastructure.
//!
//! A user program requests kernel services by executing a syscall trampoline
//! (see [`Instruction::syscall`]). Its [`MicroOp::SyscallHandler`] micro-op
//! lands in [`SystemCallDispatcher::dispatch`] with the process that was
//! running on the core. The trampoline's following [`MicroOp::SwitchContext`]
//! then hands the core to another process if the caller blocked or exited,
//! after which the core hands a pending I/O request to its device.
//!
//! Only [`Syscall::IoRequest`] and [`Syscall::Exit`] have semantics. The other
//! numbers are part of the ABI so that programs can be built against them, and
//! are accepted as no-ops.
//!
//! [`Instruction::syscall`]: crate::instruction::Instruction::syscall
//! [`MicroOp::SyscallHandler`]: crate::instruction::MicroOp::SyscallHandler
//! [`MicroOp::SwitchContext`]: crate::instruction::MicroOp::SwitchContext

use crate::{
    KernelError,
    clock::CycleCounter,
    dev::{DeviceId, DeviceTable, io::IoDevice},
    process::{Pcb, Pid, ProcessState},
    sync::SpinLock,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;

/// Represents system call numbers.
///
/// The numeric values are the stable ABI of the simulated machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Syscall {
    /// Reads from a device. Reserved.
    Read = 0,
    /// Writes to a device. Reserved.
    Write = 1,
    /// Terminates the calling process.
    Exit = 2,
    /// Duplicates the calling process. Reserved.
    Fork = 3,
    /// Replaces the program of the calling process. Reserved.
    Exec = 4,
    /// Submits an I/O request and blocks until it completes.
    IoRequest = 5,
}

/// Callback invoked with the pid of every exiting process.
pub type ExitHook = Arc<dyn Fn(Pid) + Send + Sync>;

/// An I/O request accepted by [`SystemCallDispatcher::dispatch`] but not yet
/// handed to its device.
///
/// The core submits it once the caller's context is saved, so that a fast
/// completion cannot re-admit a process that still occupies the core.
#[must_use]
pub struct IoSubmission {
    device: Arc<IoDevice>,
    pcb: Arc<Pcb>,
    units: u64,
}

impl IoSubmission {
    /// Hands the request to the device.
    pub fn submit(self) {
        self.device.submit(self.pcb, self.units);
    }
}

/// Executes system calls on behalf of the running process.
pub struct SystemCallDispatcher {
    devices: Arc<DeviceTable>,
    cycles: CycleCounter,
    exit_hooks: SpinLock<Vec<ExitHook>>,
}

impl SystemCallDispatcher {
    /// Creates a dispatcher serving the devices of `devices`.
    pub fn new(devices: Arc<DeviceTable>, cycles: CycleCounter) -> Self {
        Self {
            devices,
            cycles,
            exit_hooks: SpinLock::new(Vec::new()),
        }
    }

    /// Registers a callback fired when a process exits.
    ///
    /// Hooks run on the tick thread while the clock is held: they may create
    /// processes, but must not tick the kernel.
    pub fn on_exit(&self, hook: impl Fn(Pid) + Send + Sync + 'static) {
        self.exit_hooks.with(|hooks| hooks.push(Arc::new(hook)));
    }

    /// Executes `call` for `pcb`.
    ///
    /// An I/O request blocks `pcb` and returns the submission to perform once
    /// `pcb` is off the core.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchDevice`] if an I/O request names a device that
    ///   was never registered.
    pub fn dispatch(
        &self,
        pcb: &Arc<Pcb>,
        call: Syscall,
        device: DeviceId,
        units: u64,
    ) -> Result<Option<IoSubmission>, KernelError> {
        match call {
            Syscall::IoRequest => {
                let device = self
                    .devices
                    .get(device)
                    .ok_or(KernelError::NoSuchDevice(device))?;
                log::debug!(
                    "Syscall: pid {} requests {} unit(s) from device {} ({}).",
                    pcb.pid,
                    units,
                    device.id(),
                    device.name()
                );
                if !pcb.transition_unless_terminated(ProcessState::Waiting) {
                    return Ok(None);
                }
                pcb.begin_wait(self.cycles.now());
                Ok(Some(IoSubmission {
                    device,
                    pcb: pcb.clone(),
                    units,
                }))
            }
            Syscall::Exit => {
                pcb.set_state(ProcessState::Terminated);
                log::debug!("Syscall: pid {} ({}) exited.", pcb.pid, pcb.name);
                let hooks = self.exit_hooks.with(|hooks| hooks.clone());
                for hook in hooks {
                    hook(pcb.pid);
                }
                Ok(None)
            }
            Syscall::Read | Syscall::Write | Syscall::Fork | Syscall::Exec => {
                log::debug!(
                    "Syscall: {:?} from pid {} is reserved; ignored.",
                    call,
                    pcb.pid
                );
                Ok(None)
            }
        }
    }
}
