//! # vmkernel: a tick-driven SMP kernel simulator
//!
//! **vmkernel** simulates a symmetric multiprocessor running user processes
//! under a configurable scheduler. It is built for studying how the pieces of
//! a kernel's execution path interact: the fetch/execute loop of a core, the
//! interrupt controller and service routines, preemptive scheduling, context
//! switching, and asynchronous devices that report completion through
//! interrupts.
//!
//! ## Execution model
//!
//! Time advances in discrete **ticks** (cycles). On every tick the [`Clock`]
//! notifies its listeners in registration order: for each core, the [`Cpu`]
//! and then its [`TimerDevice`], and finally the global cycle counter. Cores
//! therefore never race with each other within one tick.
//!
//! A core executes exactly one [`MicroOp`] per tick. Instructions decode into
//! micro-ops; interrupts are serviced by installing a micro-op sequence built
//! by the [`InterruptService`]; system calls are instructions whose micro-ops
//! enter the kernel, run the [`SystemCallDispatcher`] and switch context.
//!
//! The only true concurrency lives in the I/O devices: each [`IoDevice`] runs
//! its channels on background workers that sleep for the simulated latency and
//! raise an external interrupt on completion.
//!
//! ## Getting started
//!
//! ```no_run
//! use vmkernel::{
//!     Kernel, SystemConfiguration,
//!     instruction::{Instruction, Program},
//!     process::Register,
//!     thread::SchedulerKind,
//! };
//!
//! let configuration = SystemConfiguration::builder()
//!     .cores(2)
//!     .quantum(5)
//!     .scheduler(SchedulerKind::RoundRobin)
//!     .build()?;
//! let kernel = Kernel::initialize(configuration)?;
//! let disk = kernel.register_device("disk", 10, 1)?;
//! let program = Program::new(
//!     "reader",
//!     vec![
//!         Instruction::mov(Register::R0, 1),
//!         Instruction::io(disk, 2),
//!         Instruction::exit(),
//!     ],
//! );
//! let pid = kernel.create_process(program, 10)?;
//! kernel.run(1_000)?;
//! # let _ = pid;
//! # Ok::<(), vmkernel::KernelError>(())
//! ```
//!
//! [`Clock`]: clock::Clock
//! [`Cpu`]: cpu::Cpu
//! [`TimerDevice`]: dev::timer::TimerDevice
//! [`MicroOp`]: instruction::MicroOp
//! [`InterruptService`]: interrupt::service::InterruptService
//! [`SystemCallDispatcher`]: syscall::SystemCallDispatcher
//! [`IoDevice`]: dev::io::IoDevice

#![deny(missing_docs)]

pub mod clock;
pub mod cpu;
pub mod dev;
pub mod instruction;
pub mod interrupt;
pub mod kernel;
pub mod monitor;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;

use core::{fmt, time::Duration};
use dev::DeviceId;
use process::Pid;
use thread::SchedulerKind;

pub use kernel::Kernel;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur while
/// configuring the kernel, registering devices and processes, or executing a
/// tick.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// The scheduler name does not name a known scheduler.
    UnknownScheduler(String),
    /// An I/O request named a device that was never registered.
    NoSuchDevice(DeviceId),
    /// No process with the given pid.
    NoSuchProcess(Pid),
    /// A vector was raised that no interrupt handler claims.
    UnhandledInterrupt(u8),
    /// No space left for another device. (ENOSPC)
    NoSpace,
    /// Resource busy. (EBUSY)
    Busy,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::UnknownScheduler(name) => write!(f, "unknown scheduler `{name}`"),
            KernelError::NoSuchDevice(id) => write!(f, "no such device: {id}"),
            KernelError::NoSuchProcess(pid) => write!(f, "no such process: {pid}"),
            KernelError::UnhandledInterrupt(vector) => {
                write!(f, "unhandled interrupt vector {vector}")
            }
            KernelError::NoSpace => write!(f, "no interrupt vector left for another device"),
            KernelError::Busy => write!(f, "resource busy"),
        }
    }
}

impl std::error::Error for KernelError {}

/// System-wide settings consumed by [`Kernel::initialize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemConfiguration {
    /// Number of simulated cores.
    pub cores: usize,
    /// Ticks between two timer interrupts on a core.
    ///
    /// Servicing the timer takes four ticks, so a quantum of four or less
    /// leaves no cycle to user code.
    pub quantum: u64,
    /// Scheduling policy.
    pub scheduler: SchedulerKind,
    /// Real-time length of one device tick.
    pub tick_duration: Duration,
    /// Seed for the interrupt controller's core selection. `None` seeds from
    /// the operating system.
    pub interrupt_seed: Option<u64>,
}

impl SystemConfiguration {
    /// Starts building a configuration from the defaults.
    pub fn builder() -> SystemConfigurationBuilder {
        SystemConfigurationBuilder {
            configuration: Self::default(),
        }
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            cores: 1,
            quantum: 5,
            scheduler: SchedulerKind::RoundRobin,
            tick_duration: Duration::from_millis(1),
            interrupt_seed: None,
        }
    }
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring the system-wide settings before initialization, such as the
/// number of cores and the scheduling policy. [`build`] validates the result.
///
/// [`build`]: SystemConfigurationBuilder::build
#[derive(Clone, Debug)]
pub struct SystemConfigurationBuilder {
    configuration: SystemConfiguration,
}

impl SystemConfigurationBuilder {
    /// Sets the number of cores.
    pub fn cores(mut self, cores: usize) -> Self {
        self.configuration.cores = cores;
        self
    }

    /// Sets the scheduling quantum, in ticks.
    pub fn quantum(mut self, quantum: u64) -> Self {
        self.configuration.quantum = quantum;
        self
    }

    /// Sets the system-wide scheduler.
    pub fn scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.configuration.scheduler = scheduler;
        self
    }

    /// Sets the real-time length of a device tick.
    pub fn tick_duration(mut self, tick_duration: Duration) -> Self {
        self.configuration.tick_duration = tick_duration;
        self
    }

    /// Makes the interrupt controller's core selection deterministic.
    pub fn interrupt_seed(mut self, seed: u64) -> Self {
        self.configuration.interrupt_seed = Some(seed);
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if there is no core or the quantum
    ///   is zero.
    pub fn build(self) -> Result<SystemConfiguration, KernelError> {
        let configuration = self.configuration;
        if configuration.cores == 0 || configuration.quantum == 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(configuration)
    }
}
