//! Process control blocks.
//!
//! A [`Pcb`] is the kernel's record of a process. It is shared through an
//! [`Arc`] between the process table, the scheduler's ready structure, a
//! device's queues and a core's current slot; at any instant exactly one of
//! the latter three owns the right to run it.
//!
//! The saved register state ([`Context`]) lives inside the PCB only while the
//! process is off-core. While a process runs, its registers live in the
//! [`Cpu`] and are transferred back by the [`Dispatcher`].
//!
//! [`Cpu`]: crate::cpu::Cpu
//! [`Dispatcher`]: crate::thread::dispatcher::Dispatcher

use crate::{
    KernelError,
    sync::{
        SpinLock,
        atomic::{AtomicI64, AtomicU64},
    },
};
use core::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;

/// Process identifier.
pub type Pid = u64;

/// Identifier of a simulated core.
pub type CoreId = usize;

/// Lowest static priority a process may be created with.
pub const MIN_PRIORITY: i32 = 0;
/// Highest static priority a process may be created with.
pub const MAX_PRIORITY: i32 = 31;
/// Width of the band around the static priority in which the dynamic priority
/// may move.
pub const PRIORITY_BAND: i32 = 4;
/// Initial stack pointer of a freshly created process.
pub const STACK_TOP: usize = 0x7fff_f000;

/// A register of the simulated core.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Register {
    /// General purpose register 0.
    R0 = 0,
    /// General purpose register 1.
    R1 = 1,
    /// General purpose register 2.
    R2 = 2,
    /// General purpose register 3.
    R3 = 3,
    /// General purpose register 4.
    R4 = 4,
    /// General purpose register 5.
    R5 = 5,
    /// General purpose register 6.
    R6 = 6,
    /// General purpose register 7.
    R7 = 7,
    /// Zero flag.
    ZF = 8,
    /// Carry flag.
    CF = 9,
}

impl Register {
    /// Number of registers in a [`RegisterFile`].
    pub const COUNT: usize = 10;

    /// Every register, in index order.
    pub const ALL: [Register; Register::COUNT] = [
        Register::R0,
        Register::R1,
        Register::R2,
        Register::R3,
        Register::R4,
        Register::R5,
        Register::R6,
        Register::R7,
        Register::ZF,
        Register::CF,
    ];

    fn name(self) -> &'static str {
        match self {
            Register::R0 => "R0",
            Register::R1 => "R1",
            Register::R2 => "R2",
            Register::R3 => "R3",
            Register::R4 => "R4",
            Register::R5 => "R5",
            Register::R6 => "R6",
            Register::R7 => "R7",
            Register::ZF => "ZF",
            Register::CF => "CF",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Register::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s.trim()))
            .ok_or(KernelError::InvalidArgument)
    }
}

bitflags::bitflags! {
    /// Condition flags produced by the ALU.
    pub struct AluFlags: u8 {
        /// The result was zero.
        const ZF = 1 << 0;
        /// The unsigned operation carried out (or borrowed).
        const CF = 1 << 1;
    }
}

/// The register file of a core, indexed by [`Register`].
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct RegisterFile([i64; Register::COUNT]);

impl RegisterFile {
    /// A register file with every register cleared.
    pub const fn zeroed() -> Self {
        Self([0; Register::COUNT])
    }

    /// Builds a register file from `(register, value)` pairs; unspecified
    /// registers are zero.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Register, i64)>) -> Self {
        let mut regs = Self::zeroed();
        for (reg, value) in pairs {
            regs[reg] = value;
        }
        regs
    }

    /// Reads the flag registers as [`AluFlags`].
    pub fn flags(&self) -> AluFlags {
        let mut flags = AluFlags::empty();
        flags.set(AluFlags::ZF, self[Register::ZF] != 0);
        flags.set(AluFlags::CF, self[Register::CF] != 0);
        flags
    }

    /// Writes [`AluFlags`] back into the flag registers.
    pub fn set_flags(&mut self, flags: AluFlags) {
        self[Register::ZF] = flags.contains(AluFlags::ZF) as i64;
        self[Register::CF] = flags.contains(AluFlags::CF) as i64;
    }
}

impl Index<Register> for RegisterFile {
    type Output = i64;

    fn index(&self, reg: Register) -> &i64 {
        &self.0[u8::from(reg) as usize]
    }
}

impl IndexMut<Register> for RegisterFile {
    fn index_mut(&mut self, reg: Register) -> &mut i64 {
        &mut self.0[u8::from(reg) as usize]
    }
}

/// Execution context that is transferred between a core and a PCB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Context {
    /// Index of the next instruction to fetch.
    pub pc: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Register file.
    pub regs: RegisterFile,
}

/// A possible state of the process.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ProcessState {
    /// Created but not admitted yet.
    New,
    /// Waiting in a ready structure.
    Ready,
    /// Installed on a core.
    Running,
    /// Blocked on an I/O request.
    Waiting,
    /// Exited. Never scheduled again.
    Terminated,
}

/// A process control block.
pub struct Pcb {
    /// Process id.
    pub pid: Pid,
    /// Process name.
    pub name: String,
    /// Static priority assigned at creation.
    pub static_priority: i32,
    idle_of: Option<CoreId>,
    state: SpinLock<ProcessState>,
    context: SpinLock<Context>,
    dynamic_priority: AtomicI64,
    user_cycles: AtomicU64,
    syscall_cycles: AtomicU64,
    wait_cycles: AtomicU64,
    last_dispatch_cycle: AtomicU64,
    last_enqueue_cycle: AtomicU64,
    wait_started_cycle: AtomicU64,
    dispatch_count: AtomicU64,
}

impl Pcb {
    /// Creates a PCB in the [`ProcessState::New`] state.
    ///
    /// `now` seeds the aging timestamps so that the first admission measures
    /// the time spent since creation.
    pub fn new(
        pid: Pid,
        name: impl Into<String>,
        static_priority: i32,
        context: Context,
        now: u64,
    ) -> Arc<Self> {
        Arc::new(Self::build(pid, name.into(), static_priority, context, now))
    }

    fn build(pid: Pid, name: String, static_priority: i32, context: Context, now: u64) -> Self {
        Self {
            pid,
            name,
            static_priority,
            idle_of: None,
            state: SpinLock::new(ProcessState::New),
            context: SpinLock::new(context),
            dynamic_priority: AtomicI64::new(static_priority as i64),
            user_cycles: AtomicU64::new(0),
            syscall_cycles: AtomicU64::new(0),
            wait_cycles: AtomicU64::new(0),
            last_dispatch_cycle: AtomicU64::new(now),
            last_enqueue_cycle: AtomicU64::new(now),
            wait_started_cycle: AtomicU64::new(now),
            dispatch_count: AtomicU64::new(0),
        }
    }

    /// Creates the idle process of `core`.
    ///
    /// The idle process starts [`ProcessState::Ready`] and has the lowest
    /// priority.
    pub fn idle(pid: Pid, core: CoreId) -> Arc<Self> {
        let mut pcb = Self::build(pid, format!("idle{core}"), MIN_PRIORITY, Context::default(), 0);
        pcb.idle_of = Some(core);
        *pcb.state.get_mut() = ProcessState::Ready;
        Arc::new(pcb)
    }

    /// Returns the core this PCB idles, if it is an idle process.
    pub fn idle_of(&self) -> Option<CoreId> {
        self.idle_of
    }

    /// Returns `true` if this is an idle process.
    pub fn is_idle(&self) -> bool {
        self.idle_of.is_some()
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.state.with(|s| *s)
    }

    /// Unconditionally sets the state.
    pub fn set_state(&self, state: ProcessState) {
        self.state.with(|s| *s = state)
    }

    /// Moves the process to `state` unless it has terminated.
    ///
    /// Returns `false` if the process is terminated. Check and update happen
    /// under one lock acquisition, so an exit racing a device completion cannot
    /// resurrect the process.
    pub fn transition_unless_terminated(&self, state: ProcessState) -> bool {
        let mut guard = self.state.lock();
        let alive = *guard != ProcessState::Terminated;
        if alive {
            *guard = state;
        }
        guard.unlock();
        alive
    }

    /// Returns `true` once the process exited.
    pub fn is_terminated(&self) -> bool {
        self.state() == ProcessState::Terminated
    }

    /// Saved context.
    pub fn context(&self) -> Context {
        self.context.with(|c| *c)
    }

    /// Overwrites the saved context.
    pub fn save_context(&self, context: Context) {
        self.context.with(|c| *c = context)
    }

    /// Current dynamic priority.
    pub fn dynamic_priority(&self) -> i32 {
        self.dynamic_priority.load() as i32
    }

    pub(crate) fn set_dynamic_priority(&self, priority: i32) {
        self.dynamic_priority.store(priority as i64)
    }

    /// Cycles spent executing user code.
    pub fn user_cycles(&self) -> u64 {
        self.user_cycles.load()
    }

    /// Cycles spent inside syscall trampolines.
    pub fn syscall_cycles(&self) -> u64 {
        self.syscall_cycles.load()
    }

    /// Cycles spent blocked on I/O.
    pub fn wait_cycles(&self) -> u64 {
        self.wait_cycles.load()
    }

    /// Cycles this process consumed on a core.
    pub fn cpu_cycles(&self) -> u64 {
        self.user_cycles() + self.syscall_cycles()
    }

    /// Number of times the process was installed on a core.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load()
    }

    /// Cycle of the last dispatch.
    pub fn last_dispatch_cycle(&self) -> u64 {
        self.last_dispatch_cycle.load()
    }

    /// Cycle of the last admission into a ready structure.
    pub fn last_enqueue_cycle(&self) -> u64 {
        self.last_enqueue_cycle.load()
    }

    pub(crate) fn charge_user_cycle(&self) {
        self.user_cycles.increment()
    }

    pub(crate) fn charge_syscall_cycle(&self) {
        self.syscall_cycles.increment()
    }

    pub(crate) fn stamp_enqueue(&self, now: u64) {
        self.last_enqueue_cycle.store(now)
    }

    pub(crate) fn stamp_dispatch(&self, now: u64) {
        self.last_dispatch_cycle.store(now);
        self.dispatch_count.increment();
    }

    /// Records the beginning of an I/O wait.
    pub(crate) fn begin_wait(&self, now: u64) {
        self.wait_started_cycle.store(now)
    }

    /// Accounts the time since [`Pcb::begin_wait`] as wait cycles.
    pub(crate) fn end_wait(&self, now: u64) {
        let started = self.wait_started_cycle.load();
        self.wait_cycles.fetch_add(now.saturating_sub(started));
    }
}

impl fmt::Debug for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pcb")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("static_priority", &self.static_priority)
            .field("dynamic_priority", &self.dynamic_priority())
            .finish()
    }
}
