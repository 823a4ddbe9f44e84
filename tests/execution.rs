//! Instruction execution, exceptions and process lifecycle.

mod common;

use common::{cpu_bound, kernel, run_until, spinner};
use std::{
    sync::{Arc, Weak},
    thread,
    time::Duration,
};
use vmkernel::{
    Kernel, KernelError,
    clock::Ticker,
    instruction::{AluOp, Condition, Instruction, MicroOp, Program},
    interrupt::{InterruptHandler, Vector},
    process::{Pid, ProcessState, Register, STACK_TOP},
    sync::{SpinLock, atomic::AtomicUsize},
    thread::SchedulerKind,
};

/// Tests a single process on a single core.
///
/// This test ensures that:
/// - Four arithmetic instructions followed by `exit` run to completion under
///   round robin with a quantum of five ticks.
/// - The core counts every instruction it completed.
/// - The saved context holds the final register values.
#[test]
fn single_process_runs_to_completion() {
    let kernel = kernel(1, 5, SchedulerKind::RoundRobin);
    let program = Program::new(
        "arith",
        vec![
            Instruction::mov(Register::R0, 6),
            Instruction::add(Register::R0, Register::R0, 4i64),
            Instruction::alu(AluOp::Mul, Register::R0, Register::R0, 3i64),
            Instruction::alu(AluOp::Sub, Register::R0, Register::R0, 30i64),
            Instruction::exit(),
        ],
    );
    let pid = kernel.create_process(program, 10).unwrap();
    let pcb = kernel.process(pid).unwrap();

    run_until(&kernel, Duration::from_secs(5), || pcb.is_terminated());

    let counters = &kernel.core_counters()[0];
    assert!(counters.instructions_fetched >= 5);
    assert!(counters.user > 0);
    assert!(counters.syscall > 0);
    let context = pcb.context();
    assert_eq!(context.regs[Register::R0], 0);
    assert_eq!(context.regs[Register::ZF], 1);
    assert_eq!(context.pc, 5);
    assert_eq!(context.sp, STACK_TOP);
    assert!(pcb.dispatch_count() >= 1);
}

/// Tests context preservation across preemption.
///
/// This test ensures that:
/// - Two processes interleaved on one core each observe only their own
///   registers, so both loops end with the expected counts.
/// - Initial registers of a program are loaded into its context.
#[test]
fn contexts_survive_preemption() {
    let kernel = kernel(1, 5, SchedulerKind::RoundRobin);
    let counter = |name: &str, limit: i64, start: i64| {
        Program::new(
            name,
            vec![
                Instruction::add(Register::R0, Register::R0, 1i64),
                Instruction::cmp(Register::R0, limit),
                Instruction::branch(Condition::NotZero, 0),
                Instruction::exit(),
            ],
        )
        .with_register(Register::R0, start)
        .with_register(Register::R5, limit)
    };
    let a = kernel.create_process(counter("a", 20, 0), 10).unwrap();
    let b = kernel.create_process(counter("b", 35, 10), 10).unwrap();
    let pids = [a, b];

    run_until(&kernel, Duration::from_secs(5), || {
        common::all_terminated(&kernel, &pids)
    });

    let (a, b) = (kernel.process(a).unwrap(), kernel.process(b).unwrap());
    assert!(a.dispatch_count() > 1 && b.dispatch_count() > 1);
    assert_eq!(a.context().regs[Register::R0], 20);
    assert_eq!(a.context().regs[Register::R5], 20);
    assert_eq!(b.context().regs[Register::R0], 35);
    assert_eq!(b.context().regs[Register::R5], 35);
}

/// Tests the divide-error exception.
///
/// This test ensures that:
/// - Dividing by zero leaves the destination unchanged.
/// - The exception reschedules the core and the process resumes after the
///   faulting instruction.
#[test]
fn divide_by_zero_is_recoverable() {
    let kernel = kernel(1, 5, SchedulerKind::RoundRobin);
    let program = Program::new(
        "div0",
        vec![
            Instruction::mov(Register::R0, 5),
            Instruction::alu(AluOp::Div, Register::R0, Register::R0, 0i64),
            Instruction::mov(Register::R1, 7),
            Instruction::exit(),
        ],
    );
    let pid = kernel.create_process(program, 10).unwrap();
    let pcb = kernel.process(pid).unwrap();

    run_until(&kernel, Duration::from_secs(5), || pcb.is_terminated());

    assert_eq!(pcb.context().regs[Register::R0], 5);
    assert_eq!(pcb.context().regs[Register::R1], 7);
    assert!(pcb.dispatch_count() >= 2);
}

struct SoftwareInterrupt {
    serviced: Arc<AtomicUsize>,
}

impl InterruptHandler for SoftwareInterrupt {
    fn can_handle(&self, vector: Vector) -> bool {
        vector == Vector(200)
    }

    fn body(&self, _vector: Vector) -> Vec<MicroOp> {
        self.serviced.increment();
        Vec::new()
    }
}

/// Tests interrupt handler registration.
///
/// This test ensures that:
/// - A vector no handler claims fails the tick with
///   [`KernelError::UnhandledInterrupt`].
/// - Once a handler claiming the vector is registered, the vector is serviced
///   by an entry/exit pair around the handler's body.
#[test]
fn unclaimed_vectors_fail_the_tick() {
    let kernel = kernel(1, 5, SchedulerKind::RoundRobin);
    let controller = kernel.interrupt_controller();
    controller.raise_local(Vector(200), 0).unwrap();
    assert_eq!(kernel.tick(), Err(KernelError::UnhandledInterrupt(200)));

    let serviced = Arc::new(AtomicUsize::new(0));
    kernel.register_interrupt_handler(SoftwareInterrupt {
        serviced: serviced.clone(),
    });
    controller.raise_local(Vector(200), 0).unwrap();
    kernel.run(3).unwrap();
    assert_eq!(serviced.load(), 1);
    assert_eq!(kernel.core_counters()[0].interrupt, 3);
    assert_eq!(
        controller.raise_local(Vector(200), 1),
        Err(KernelError::InvalidArgument)
    );
}

/// Tests termination callbacks.
///
/// This test ensures that:
/// - Every exiting process is reported exactly once.
/// - A callback may create a new process, which then runs to completion.
#[test]
fn termination_callbacks_fire_once() {
    let kernel = kernel(2, 5, SchedulerKind::Priority);
    let exited = Arc::new(SpinLock::new(Vec::<Pid>::new()));
    let respawned = Arc::new(SpinLock::new(None::<Pid>));

    let first = kernel
        .create_process(cpu_bound("first", Register::R0, 3), 10)
        .unwrap();
    let second = kernel
        .create_process(cpu_bound("second", Register::R0, 5), 10)
        .unwrap();

    let record = exited.clone();
    kernel.on_process_terminated(move |pid| record.with(|pids| pids.push(pid)));
    let weak: Weak<Kernel> = Arc::downgrade(&kernel);
    let spawned = respawned.clone();
    kernel.on_process_terminated(move |pid| {
        if pid != first {
            return;
        }
        if let Some(kernel) = weak.upgrade() {
            let child = kernel
                .create_process(cpu_bound("child", Register::R1, 2), 10)
                .unwrap();
            spawned.with(|slot| *slot = Some(child));
        }
    });

    run_until(&kernel, Duration::from_secs(5), || {
        respawned.with(|slot| *slot).is_some_and(|child| {
            common::all_terminated(&kernel, &[first, second, child])
        })
    });

    let child = respawned.with(|slot| *slot).unwrap();
    let mut pids = exited.with(|pids| pids.clone());
    pids.sort_unstable();
    assert_eq!(pids, vec![first, second, child]);
}

/// Tests removal of processes from the process table.
///
/// This test ensures that:
/// - A live process cannot be removed.
/// - A terminated process stays visible until it is removed, then is gone.
#[test]
fn terminated_processes_are_removed_on_demand() {
    let kernel = kernel(1, 5, SchedulerKind::RoundRobin);
    let pid = kernel
        .create_process(cpu_bound("short", Register::R0, 2), 10)
        .unwrap();
    assert_eq!(kernel.remove_process(pid).err(), Some(KernelError::Busy));

    let pcb = kernel.process(pid).unwrap();
    run_until(&kernel, Duration::from_secs(5), || pcb.is_terminated());
    assert_eq!(kernel.process_ids(), vec![pid]);

    let removed = kernel.remove_process(pid).unwrap();
    assert!(Arc::ptr_eq(&removed, &pcb));
    assert!(kernel.process_ids().is_empty());
    assert_eq!(
        kernel.remove_process(pid).err(),
        Some(KernelError::NoSuchProcess(pid))
    );
    assert_eq!(
        kernel.create_process(spinner("bad"), 32).err(),
        Some(KernelError::InvalidArgument)
    );
}

/// Tests the background ticker.
///
/// This test ensures that:
/// - A ticker advances the kernel until stopped and reports how many ticks
///   it delivered.
#[test]
fn ticker_drives_the_kernel() {
    let kernel = kernel(2, 5, SchedulerKind::RoundRobin);
    let pid = kernel.create_process(spinner("spin"), 10).unwrap();
    let ticker = Ticker::spawn(kernel.clone(), Duration::ZERO);
    thread::sleep(Duration::from_millis(20));
    assert!(!ticker.is_finished());
    let ticks = ticker.stop().unwrap();

    assert!(ticks > 0);
    assert_eq!(kernel.cycles(), ticks);
    assert_eq!(kernel.process(pid).unwrap().state(), ProcessState::Running);
}
