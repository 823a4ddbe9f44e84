//! Instructions, micro-operations and programs.
//!
//! An [`Instruction`] is the fetch unit of the simulated core. It decodes into
//! an ordered list of [`MicroOp`]s, and the core executes exactly one micro-op
//! per tick. Micro-ops are plain data: every operand they need is carried in
//! the variant, and [`Cpu::execute`] interprets them.
//!
//! A system call is an instruction whose micro-ops form a trampoline:
//! ```text
//! [IrqEntry, SyscallHandler(call, device, units), SwitchContext, IrqExit]
//! ```
//!
//! [`Cpu::execute`]: crate::cpu::Cpu::execute

use crate::{
    dev::DeviceId,
    process::{Register, RegisterFile},
    syscall::Syscall,
};
use std::sync::Arc;

/// ALU operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    /// `dst = lhs + rhs`
    Add,
    /// `dst = lhs - rhs`
    Sub,
    /// `dst = lhs * rhs`
    Mul,
    /// `dst = lhs / rhs`; dividing by zero raises the divide-error exception.
    Div,
    /// `dst = lhs & rhs`
    And,
    /// `dst = lhs | rhs`
    Or,
    /// `dst = lhs ^ rhs`
    Xor,
    /// Computes `lhs - rhs` for the flags only.
    Cmp,
}

/// Second operand of an ALU operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Value of a register.
    Reg(Register),
    /// Immediate value.
    Imm(i64),
}

impl From<Register> for Operand {
    fn from(reg: Register) -> Self {
        Operand::Reg(reg)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Imm(value)
    }
}

/// Branch conditions, evaluated on the flag registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// ZF is set.
    Zero,
    /// ZF is clear.
    NotZero,
    /// CF is set.
    Carry,
    /// CF is clear.
    NotCarry,
}

/// A micro-operation, the unit of work executed per tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MicroOp {
    /// `dst = value`
    SetImmediate {
        /// Destination register.
        dst: Register,
        /// Value to load.
        value: i64,
    },
    /// `dst = lhs <op> rhs`, updating ZF and CF.
    Binary {
        /// Operation.
        op: AluOp,
        /// Destination register.
        dst: Register,
        /// First operand.
        lhs: Register,
        /// Second operand.
        rhs: Operand,
    },
    /// Jumps to `target` if `cond` holds.
    Branch {
        /// Condition on the flags.
        cond: Condition,
        /// Instruction index.
        target: usize,
    },
    /// Unconditionally jumps to `target`.
    Jump {
        /// Instruction index.
        target: usize,
    },
    /// Marks entry into the kernel.
    IrqEntry,
    /// Marks return from the kernel.
    IrqExit,
    /// Asks the scheduler for the next process and dispatches it.
    SwitchContext,
    /// Drains the waiters of `device` and re-admits them.
    IoHandler {
        /// Device whose completions are serviced.
        device: DeviceId,
    },
    /// Executes a system call on behalf of the current process.
    SyscallHandler {
        /// Requested service.
        call: Syscall,
        /// Target device for [`Syscall::IoRequest`].
        device: DeviceId,
        /// Operation units for [`Syscall::IoRequest`].
        units: u64,
    },
    /// Burns one cycle.
    Idle,
}

/// An instruction: a mnemonic and the micro-ops it decodes into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Mnemonic, for display.
    pub mnemonic: String,
    /// Micro-op sequence.
    pub micro_ops: Vec<MicroOp>,
}

impl Instruction {
    /// Creates an instruction from its parts.
    pub fn new(mnemonic: impl Into<String>, micro_ops: Vec<MicroOp>) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            micro_ops,
        }
    }

    /// `mov dst, value`
    pub fn mov(dst: Register, value: i64) -> Self {
        Self::new("mov", vec![MicroOp::SetImmediate { dst, value }])
    }

    /// An ALU instruction `op dst, lhs, rhs`.
    pub fn alu(op: AluOp, dst: Register, lhs: Register, rhs: impl Into<Operand>) -> Self {
        let mnemonic = match op {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::Div => "div",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        };
        Self::new(
            mnemonic,
            vec![MicroOp::Binary {
                op,
                dst,
                lhs,
                rhs: rhs.into(),
            }],
        )
    }

    /// `add dst, lhs, rhs`
    pub fn add(dst: Register, lhs: Register, rhs: impl Into<Operand>) -> Self {
        Self::alu(AluOp::Add, dst, lhs, rhs)
    }

    /// `cmp lhs, rhs`
    pub fn cmp(lhs: Register, rhs: impl Into<Operand>) -> Self {
        Self::alu(AluOp::Cmp, lhs, lhs, rhs)
    }

    /// `jmp target`
    pub fn jump(target: usize) -> Self {
        Self::new("jmp", vec![MicroOp::Jump { target }])
    }

    /// Conditional branch to `target`.
    pub fn branch(cond: Condition, target: usize) -> Self {
        let mnemonic = match cond {
            Condition::Zero => "jz",
            Condition::NotZero => "jnz",
            Condition::Carry => "jc",
            Condition::NotCarry => "jnc",
        };
        Self::new(mnemonic, vec![MicroOp::Branch { cond, target }])
    }

    /// `nop`: one idle micro-op.
    pub fn nop() -> Self {
        Self::new("nop", vec![MicroOp::Idle])
    }

    /// A system call trampoline.
    pub fn syscall(call: Syscall, device: DeviceId, units: u64) -> Self {
        Self::new(
            "syscall",
            vec![
                MicroOp::IrqEntry,
                MicroOp::SyscallHandler {
                    call,
                    device,
                    units,
                },
                MicroOp::SwitchContext,
                MicroOp::IrqExit,
            ],
        )
    }

    /// Requests `units` operation units from `device`.
    pub fn io(device: DeviceId, units: u64) -> Self {
        Self::syscall(Syscall::IoRequest, device, units)
    }

    /// Terminates the process.
    pub fn exit() -> Self {
        Self::syscall(Syscall::Exit, 0, 0)
    }
}

/// A program: initial registers plus an immutable instruction list.
#[derive(Clone, Debug)]
pub struct Program {
    /// Program name; becomes the process name.
    pub name: String,
    /// Initial register values.
    pub registers: RegisterFile,
    /// Instruction list, shared with the cores executing it.
    pub instructions: Arc<[Instruction]>,
}

impl Program {
    /// Creates a program with zeroed registers.
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            registers: RegisterFile::zeroed(),
            instructions: instructions.into(),
        }
    }

    /// Sets the initial value of `reg`.
    pub fn with_register(mut self, reg: Register, value: i64) -> Self {
        self.registers[reg] = value;
        self
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the program has no instruction.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instruction at `pc`, if any.
    pub fn fetch(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }
}
