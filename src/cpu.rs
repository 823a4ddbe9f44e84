//! The simulated core.
//!
//! A [`Cpu`] is advanced by the clock once per tick and performs exactly one
//! step per tick, in the following order of precedence:
//!
//! 1. If micro-ops are pending, execute the oldest one.
//! 2. Otherwise, if the interrupt controller has a vector ready for this core,
//!    install the interrupt service routine for it.
//! 3. Otherwise, fetch the instruction at the program counter of the current
//!    process, install its micro-ops and advance the program counter. A
//!    process without instructions left (and the idle process) idles.
//!
//! Interrupts are thus only taken at instruction boundaries, and an
//! instruction, once fetched, runs to completion on the core even if it
//! switches context midway.
//!
//! ## Cycle accounting
//!
//! Every tick is counted in exactly one class on the core's [`CpuCounters`]:
//!
//! | Class       | Ticks                                                        |
//! |-------------|--------------------------------------------------------------|
//! | `interrupt` | installing or executing an interrupt service routine         |
//! | `syscall`   | executing a fetched op between `IrqEntry` and `IrqExit`      |
//! | `idle`      | executing an `Idle` op, or finding nothing to fetch          |
//! | `user`      | fetching an instruction, or executing any other fetched op   |
//!
//! User cycles are also charged to the process that was current when the op
//! started, and syscall cycles to the process that entered the trap, even once
//! the trampoline's `SwitchContext` installed another process.
//!
//! `instructions_fetched` counts the micro-op sequences a core drained:
//! fetched instructions as well as interrupt service routines.

use crate::{
    KernelError,
    clock::TickListener,
    instruction::{AluOp, Condition, MicroOp, Operand, Program},
    interrupt::Vector,
    kernel::System,
    process::{AluFlags, CoreId, Context, Pcb, Pid, Register, RegisterFile},
    sync::atomic::AtomicU64,
    syscall::IoSubmission,
    thread::Dispatcher,
};
use std::{collections::VecDeque, sync::Arc};

/// Cycle counters of a core.
///
/// Written by the core on the tick thread and read by the monitor without
/// synchronization.
#[derive(Debug, Default)]
pub struct CpuCounters {
    total: AtomicU64,
    user: AtomicU64,
    syscall: AtomicU64,
    interrupt: AtomicU64,
    idle: AtomicU64,
    instructions_fetched: AtomicU64,
    current: AtomicU64,
}

impl CpuCounters {
    /// Reads every counter.
    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            total: self.total.load(),
            user: self.user.load(),
            syscall: self.syscall.load(),
            interrupt: self.interrupt.load(),
            idle: self.idle.load(),
            instructions_fetched: self.instructions_fetched.load(),
            current: self.current.load(),
        }
    }
}

/// Values of the [`CpuCounters`] of a core at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreSnapshot {
    /// Ticks observed.
    pub total: u64,
    /// Ticks spent on user code.
    pub user: u64,
    /// Ticks spent inside syscall trampolines.
    pub syscall: u64,
    /// Ticks spent servicing interrupts.
    pub interrupt: u64,
    /// Ticks with nothing to do.
    pub idle: u64,
    /// Micro-op sequences completed, instructions and interrupt service
    /// routines alike.
    pub instructions_fetched: u64,
    /// Pid of the process on the core.
    pub current: Pid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Fetch,
    Interrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleClass {
    User,
    Syscall,
    Interrupt,
    Idle,
}

/// A simulated core.
pub struct Cpu {
    core: CoreId,
    current: Arc<Pcb>,
    pc: usize,
    sp: usize,
    regs: RegisterFile,
    pending: VecDeque<MicroOp>,
    origin: Origin,
    in_trap: bool,
    trap_owner: Option<Arc<Pcb>>,
    program: Option<Arc<Program>>,
    submissions: Vec<IoSubmission>,
    counters: Arc<CpuCounters>,
    system: Arc<System>,
}

impl Cpu {
    pub(crate) fn new(core: CoreId, system: Arc<System>, counters: Arc<CpuCounters>) -> Self {
        let idle = system.scheduler.idle(core);
        counters.current.store(idle.pid);
        let context = idle.context();
        Self {
            core,
            current: idle,
            pc: context.pc,
            sp: context.sp,
            regs: context.regs,
            pending: VecDeque::new(),
            origin: Origin::Fetch,
            in_trap: false,
            trap_owner: None,
            program: None,
            submissions: Vec::new(),
            counters,
            system,
        }
    }

    /// Id of this core.
    pub fn core_id(&self) -> CoreId {
        self.core
    }

    /// The process installed on this core.
    pub fn current(&self) -> &Arc<Pcb> {
        &self.current
    }

    /// The live register state of this core.
    pub fn context(&self) -> Context {
        Context {
            pc: self.pc,
            sp: self.sp,
            regs: self.regs,
        }
    }

    /// Cycle counters of this core.
    pub fn counters(&self) -> &Arc<CpuCounters> {
        &self.counters
    }

    /// Installs `next` with `context`, returning the previous process and the
    /// register state it leaves behind.
    pub(crate) fn swap_current(&mut self, next: Arc<Pcb>, context: Context) -> (Arc<Pcb>, Context) {
        let saved = self.context();
        self.pc = context.pc;
        self.sp = context.sp;
        self.regs = context.regs;
        self.program = None;
        self.counters.current.store(next.pid);
        (core::mem::replace(&mut self.current, next), saved)
    }

    /// Advances the core by one tick.
    ///
    /// # Errors
    /// Propagates the failure of the executed micro-op, or
    /// [`KernelError::UnhandledInterrupt`] if a fetched vector has no handler.
    pub fn tick(&mut self) -> Result<(), KernelError> {
        self.counters.total.increment();

        if let Some(op) = self.pending.pop_front() {
            let class = self.classify(&op);
            let owner = match (&self.trap_owner, class) {
                (Some(owner), CycleClass::Syscall) => owner.clone(),
                _ => self.current.clone(),
            };
            let leaves_trap = op == MicroOp::IrqExit;
            let result = self.execute(op);
            self.account(class, &owner);
            if leaves_trap {
                self.trap_owner = None;
            }
            if self.pending.is_empty() {
                self.flush_submissions();
                self.counters.instructions_fetched.increment();
            }
            return result;
        }

        if let Some(vector) = self.system.controller.fetch_ready(self.core) {
            log::trace!("Interrupt: core {} takes {}.", self.core, vector);
            let isr = self.system.interrupts.build_isr(vector)?;
            self.pending.extend(isr);
            self.origin = Origin::Interrupt;
            self.in_trap = false;
            self.trap_owner = None;
            self.counters.interrupt.increment();
            return Ok(());
        }

        let exhausted = self.program.as_ref().is_none_or(|p| self.pc >= p.len());
        if exhausted {
            self.program = self.system.program_of(self.current.pid);
        }
        let instruction = self
            .program
            .as_ref()
            .and_then(|program| program.fetch(self.pc))
            .cloned();
        match instruction {
            Some(instruction) => {
                self.pc += 1;
                self.origin = Origin::Fetch;
                self.in_trap = false;
                self.trap_owner = None;
                if instruction.micro_ops.is_empty() {
                    self.counters.instructions_fetched.increment();
                } else {
                    self.pending.extend(instruction.micro_ops);
                }
                let owner = self.current.clone();
                self.account(CycleClass::User, &owner);
            }
            None => self.counters.idle.increment(),
        }
        Ok(())
    }

    fn classify(&mut self, op: &MicroOp) -> CycleClass {
        if self.origin == Origin::Interrupt {
            return CycleClass::Interrupt;
        }
        match op {
            MicroOp::IrqEntry => {
                self.in_trap = true;
                self.trap_owner = Some(self.current.clone());
                CycleClass::Syscall
            }
            MicroOp::IrqExit => {
                self.in_trap = false;
                CycleClass::Syscall
            }
            MicroOp::Idle => CycleClass::Idle,
            _ if self.in_trap => CycleClass::Syscall,
            _ => CycleClass::User,
        }
    }

    fn account(&self, class: CycleClass, owner: &Pcb) {
        match class {
            CycleClass::User => {
                self.counters.user.increment();
                owner.charge_user_cycle();
            }
            CycleClass::Syscall => {
                self.counters.syscall.increment();
                owner.charge_syscall_cycle();
            }
            CycleClass::Interrupt => self.counters.interrupt.increment(),
            CycleClass::Idle => self.counters.idle.increment(),
        }
    }

    fn flush_submissions(&mut self) {
        for submission in self.submissions.drain(..) {
            submission.submit();
        }
    }

    /// Executes one micro-op.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchDevice`] if an `IoHandler` or an I/O system
    ///   call names an unknown device.
    pub fn execute(&mut self, op: MicroOp) -> Result<(), KernelError> {
        match op {
            MicroOp::SetImmediate { dst, value } => self.regs[dst] = value,
            MicroOp::Binary { op, dst, lhs, rhs } => self.alu(op, dst, lhs, rhs)?,
            MicroOp::Branch { cond, target } => {
                let flags = self.regs.flags();
                let taken = match cond {
                    Condition::Zero => flags.contains(AluFlags::ZF),
                    Condition::NotZero => !flags.contains(AluFlags::ZF),
                    Condition::Carry => flags.contains(AluFlags::CF),
                    Condition::NotCarry => !flags.contains(AluFlags::CF),
                };
                if taken {
                    self.pc = target;
                }
            }
            MicroOp::Jump { target } => self.pc = target,
            MicroOp::IrqEntry | MicroOp::IrqExit | MicroOp::Idle => (),
            MicroOp::SwitchContext => {
                let now = self.system.cycles.now();
                let previous = self.current.clone();
                let next = self.system.scheduler.preempt(self.core, &previous);
                Dispatcher::switch_context(self, next, now);
                self.flush_submissions();
            }
            MicroOp::IoHandler { device } => {
                let device = self
                    .system
                    .devices
                    .get(device)
                    .ok_or(KernelError::NoSuchDevice(device))?;
                let now = self.system.cycles.now();
                for pcb in device.pop_waiters() {
                    pcb.end_wait(now);
                    log::debug!(
                        "Interrupt: {} completed I/O of pid {} on core {}.",
                        device.name(),
                        pcb.pid,
                        self.core
                    );
                    self.system.scheduler.admit(pcb);
                }
            }
            MicroOp::SyscallHandler {
                call,
                device,
                units,
            } => {
                let pcb = self.current.clone();
                if let Some(submission) = self.system.syscalls.dispatch(&pcb, call, device, units)? {
                    self.submissions.push(submission);
                }
            }
        }
        Ok(())
    }

    fn alu(
        &mut self,
        op: AluOp,
        dst: Register,
        lhs: Register,
        rhs: Operand,
    ) -> Result<(), KernelError> {
        let a = self.regs[lhs];
        let b = match rhs {
            Operand::Reg(reg) => self.regs[reg],
            Operand::Imm(value) => value,
        };
        let (result, carry) = match op {
            AluOp::Add => (a.wrapping_add(b), (a as u64).overflowing_add(b as u64).1),
            AluOp::Sub | AluOp::Cmp => (a.wrapping_sub(b), (a as u64) < (b as u64)),
            AluOp::Mul => a.overflowing_mul(b),
            AluOp::Div if b == 0 => {
                log::warn!(
                    "Cpu: pid {} divided by zero on core {}.",
                    self.current.pid,
                    self.core
                );
                return self
                    .system
                    .controller
                    .raise_local(Vector::DIVIDE_ERROR, self.core);
            }
            AluOp::Div => (a.wrapping_div(b), false),
            AluOp::And => (a & b, false),
            AluOp::Or => (a | b, false),
            AluOp::Xor => (a ^ b, false),
        };
        if op != AluOp::Cmp {
            self.regs[dst] = result;
        }
        let mut flags = AluFlags::empty();
        flags.set(AluFlags::ZF, result == 0);
        flags.set(AluFlags::CF, carry);
        self.regs.set_flags(flags);
        Ok(())
    }
}

impl TickListener for Cpu {
    fn on_tick(&mut self) -> Result<(), KernelError> {
        self.tick()
    }
}
