#![allow(dead_code)]

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use vmkernel::{
    Kernel, SystemConfiguration,
    dev::DeviceId,
    instruction::{AluOp, Condition, Instruction, Program},
    process::Register,
    thread::SchedulerKind,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn kernel(cores: usize, quantum: u64, scheduler: SchedulerKind) -> Arc<Kernel> {
    init_logger();
    Kernel::initialize(
        SystemConfiguration::builder()
            .cores(cores)
            .quantum(quantum)
            .scheduler(scheduler)
            .tick_duration(Duration::from_micros(200))
            .interrupt_seed(0x5eed)
            .build()
            .unwrap(),
    )
    .unwrap()
}

/// Ticks `kernel` until `done` holds, failing after `limit` of real time.
pub fn run_until(kernel: &Kernel, limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    let mut ticks = 0u64;
    while !done() {
        kernel.tick().unwrap();
        ticks += 1;
        if ticks % 64 == 0 {
            assert!(
                Instant::now() < deadline,
                "no progress after {ticks} ticks"
            );
            thread::yield_now();
        }
    }
}

pub fn all_terminated(kernel: &Kernel, pids: &[u64]) -> bool {
    pids.iter()
        .all(|&pid| kernel.process(pid).unwrap().is_terminated())
}

/// Counts `reg` down from `iterations` to zero, then exits.
pub fn cpu_bound(name: &str, reg: Register, iterations: i64) -> Program {
    Program::new(
        name,
        vec![
            Instruction::mov(reg, iterations),
            Instruction::alu(AluOp::Sub, reg, reg, 1i64),
            Instruction::branch(Condition::NotZero, 1),
            Instruction::exit(),
        ],
    )
}

/// Issues `requests` requests of `units` units to `device`, then exits.
pub fn io_bound(name: &str, device: DeviceId, requests: i64, units: u64) -> Program {
    Program::new(
        name,
        vec![
            Instruction::mov(Register::R0, requests),
            Instruction::io(device, units),
            Instruction::alu(AluOp::Sub, Register::R0, Register::R0, 1i64),
            Instruction::branch(Condition::NotZero, 1),
            Instruction::exit(),
        ],
    )
}

/// Spins forever.
pub fn spinner(name: &str) -> Program {
    Program::new(name, vec![Instruction::nop(), Instruction::jump(0)])
}
