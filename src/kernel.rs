//! The kernel: composition root of the simulator.
//!
//! [`Kernel::initialize`] wires every component together:
//!
//! 1. the global [`CycleCounter`], the [`InterruptController`] and the
//!    [`DeviceTable`];
//! 2. one idle process per core and the configured [`Scheduler`];
//! 3. the [`InterruptService`] with its default handler chain and the
//!    [`SystemCallDispatcher`];
//! 4. for each core, a [`Cpu`] and its [`TimerDevice`], registered on the
//!    [`Clock`] in that order, followed by the cycle counter.
//!
//! After initialization, devices and processes can be added from any thread,
//! while a single thread drives the clock with [`Kernel::tick`] or
//! [`Kernel::run`] (or a [`Ticker`]).
//!
//! [`Ticker`]: crate::clock::Ticker

use crate::{
    KernelError, SystemConfiguration,
    clock::{Clock, CycleCounter},
    cpu::{CoreSnapshot, Cpu, CpuCounters},
    dev::{DeviceId, DeviceTable, io::IoDevice, timer::TimerDevice},
    instruction::Program,
    interrupt::{InterruptController, InterruptHandler, InterruptService},
    monitor::{MonitorHandle, MonitoringService},
    process::{Context, CoreId, MAX_PRIORITY, MIN_PRIORITY, Pcb, Pid, STACK_TOP},
    sync::{
        SpinLock,
        atomic::{AtomicBool, AtomicU64},
    },
    syscall::SystemCallDispatcher,
    thread::Scheduler,
};
use core::time::Duration;
use std::{collections::BTreeMap, sync::Arc};

struct ProcessEntry {
    pcb: Arc<Pcb>,
    program: Option<Arc<Program>>,
}

/// Services shared by the cores.
pub(crate) struct System {
    pub(crate) cycles: CycleCounter,
    pub(crate) controller: Arc<InterruptController>,
    pub(crate) devices: Arc<DeviceTable>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) interrupts: InterruptService,
    pub(crate) syscalls: SystemCallDispatcher,
    processes: SpinLock<BTreeMap<Pid, ProcessEntry>>,
    next_pid: AtomicU64,
    configuration: SystemConfiguration,
}

impl System {
    pub(crate) fn new(configuration: &SystemConfiguration) -> Arc<Self> {
        let cycles = CycleCounter::new();
        let controller = Arc::new(InterruptController::with_seed(
            configuration.cores,
            configuration.interrupt_seed,
        ));
        let devices = Arc::new(DeviceTable::new());

        let idles: Vec<Arc<Pcb>> = (0..configuration.cores)
            .map(|core| Pcb::idle(core as Pid, core))
            .collect();
        let processes = idles
            .iter()
            .map(|pcb| {
                (
                    pcb.pid,
                    ProcessEntry {
                        pcb: pcb.clone(),
                        program: None,
                    },
                )
            })
            .collect();
        let scheduler = configuration.scheduler.build(idles, cycles.clone());

        Arc::new(Self {
            interrupts: InterruptService::with_default_handlers(devices.clone()),
            syscalls: SystemCallDispatcher::new(devices.clone(), cycles.clone()),
            processes: SpinLock::new(processes),
            next_pid: AtomicU64::new(configuration.cores as u64),
            configuration: configuration.clone(),
            cycles,
            controller,
            devices,
            scheduler,
        })
    }

    /// Creates a process running `program` and admits it.
    pub(crate) fn spawn(&self, program: Program, priority: i32) -> Result<Pid, KernelError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(KernelError::InvalidArgument);
        }
        let pid = self.next_pid.fetch_add(1);
        let context = Context {
            pc: 0,
            sp: STACK_TOP,
            regs: program.registers,
        };
        let pcb = Pcb::new(pid, program.name.clone(), priority, context, self.cycles.now());
        self.processes.with(|processes| {
            processes.insert(
                pid,
                ProcessEntry {
                    pcb: pcb.clone(),
                    program: Some(Arc::new(program)),
                },
            )
        });
        log::debug!(
            "Kernel: created pid {} ({}) with priority {}.",
            pid,
            pcb.name,
            priority
        );
        self.scheduler.admit(pcb);
        Ok(pid)
    }

    pub(crate) fn process(&self, pid: Pid) -> Result<Arc<Pcb>, KernelError> {
        self.processes
            .with(|processes| processes.get(&pid).map(|entry| entry.pcb.clone()))
            .ok_or(KernelError::NoSuchProcess(pid))
    }

    pub(crate) fn program_of(&self, pid: Pid) -> Option<Arc<Program>> {
        self.processes
            .with(|processes| processes.get(&pid).and_then(|entry| entry.program.clone()))
    }
}

/// A simulated multiprocessor kernel.
pub struct Kernel {
    system: Arc<System>,
    clock: SpinLock<Clock>,
    counters: Vec<Arc<CpuCounters>>,
    monitors: SpinLock<Vec<MonitorHandle>>,
    shut_down: AtomicBool,
}

impl Kernel {
    /// Builds a kernel from `configuration`.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if the configuration has no core or
    ///   a zero quantum.
    pub fn initialize(configuration: SystemConfiguration) -> Result<Arc<Self>, KernelError> {
        if configuration.cores == 0 || configuration.quantum == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let system = System::new(&configuration);
        let mut clock = Clock::new();
        let mut counters = Vec::with_capacity(configuration.cores);
        for core in 0..configuration.cores {
            let core_counters = Arc::new(CpuCounters::default());
            counters.push(core_counters.clone());
            clock.register(Cpu::new(core, system.clone(), core_counters));
            clock.register(TimerDevice::new(
                core,
                configuration.quantum,
                system.controller.clone(),
            ));
        }
        clock.register(system.cycles.clone());

        log::info!(
            "Kernel: initialized {} core(s), quantum {} tick(s), {} scheduler.",
            configuration.cores,
            configuration.quantum,
            configuration.scheduler
        );
        Ok(Arc::new(Self {
            system,
            clock: SpinLock::new(clock),
            counters,
            monitors: SpinLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// The configuration the kernel was built from.
    pub fn configuration(&self) -> &SystemConfiguration {
        &self.system.configuration
    }

    /// Registers an I/O device with `channels` channels taking
    /// `base_latency` device ticks per operation unit.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `channels` is zero.
    /// - [`KernelError::NoSpace`] if every device vector is taken.
    pub fn register_device(
        &self,
        name: &str,
        base_latency: u64,
        channels: usize,
    ) -> Result<DeviceId, KernelError> {
        self.system
            .devices
            .register(
                name,
                base_latency,
                channels,
                self.system.configuration.tick_duration,
                self.system.controller.clone(),
            )
            .map(|device| device.id())
    }

    /// Creates a process running `program` with static priority `priority`
    /// and makes it ready.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `priority` is outside
    ///   `MIN_PRIORITY..=MAX_PRIORITY`.
    pub fn create_process(&self, program: Program, priority: i32) -> Result<Pid, KernelError> {
        self.system.spawn(program, priority)
    }

    /// Calls `callback` with the pid of every process that exits.
    ///
    /// The callback runs on the ticking thread, inside the tick: it may create
    /// processes but must not tick the kernel.
    pub fn on_process_terminated(&self, callback: impl Fn(Pid) + Send + Sync + 'static) {
        self.system.syscalls.on_exit(callback);
    }

    /// Appends `handler` to the interrupt handler chain.
    pub fn register_interrupt_handler(&self, handler: impl InterruptHandler + 'static) {
        self.system.interrupts.register(handler);
    }

    /// Advances the machine by one cycle.
    ///
    /// # Errors
    /// Propagates the failure of a core; see [`Cpu::tick`].
    pub fn tick(&self) -> Result<(), KernelError> {
        self.clock.with(|clock| clock.tick())
    }

    /// Advances the machine by `ticks` cycles, stopping at the first failure.
    pub fn run(&self, ticks: u64) -> Result<(), KernelError> {
        (0..ticks).try_for_each(|_| self.tick())
    }

    /// Current cycle.
    pub fn cycles(&self) -> u64 {
        self.system.cycles.now()
    }

    /// Number of cores.
    pub fn cores(&self) -> usize {
        self.counters.len()
    }

    /// Returns process `pid`.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchProcess`] if there is no such process.
    pub fn process(&self, pid: Pid) -> Result<Arc<Pcb>, KernelError> {
        self.system.process(pid)
    }

    /// Pids of the user processes in the process table, including terminated
    /// ones not yet removed.
    pub fn process_ids(&self) -> Vec<Pid> {
        self.system.processes.with(|processes| {
            processes
                .values()
                .filter(|entry| !entry.pcb.is_idle())
                .map(|entry| entry.pcb.pid)
                .collect()
        })
    }

    /// The idle process of `core`.
    pub fn idle_process(&self, core: CoreId) -> Option<Arc<Pcb>> {
        (core < self.cores()).then(|| self.system.scheduler.idle(core))
    }

    /// Drops terminated process `pid` from the process table.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchProcess`] if there is no such process.
    /// - [`KernelError::Busy`] if the process has not terminated.
    pub fn remove_process(&self, pid: Pid) -> Result<Arc<Pcb>, KernelError> {
        let mut processes = self.system.processes.lock();
        let result = match processes.get(&pid) {
            None => Err(KernelError::NoSuchProcess(pid)),
            Some(entry) if !entry.pcb.is_terminated() => Err(KernelError::Busy),
            Some(_) => processes
                .remove(&pid)
                .map(|entry| entry.pcb)
                .ok_or(KernelError::NoSuchProcess(pid)),
        };
        processes.unlock();
        result
    }

    /// Cycle counters of every core.
    pub fn core_counters(&self) -> Vec<CoreSnapshot> {
        self.counters.iter().map(|c| c.snapshot()).collect()
    }

    /// Registered I/O devices, ordered by id.
    pub fn devices(&self) -> Vec<Arc<IoDevice>> {
        self.system.devices.all()
    }

    /// Number of processes waiting in the scheduler's ready structure.
    pub fn ready_processes(&self) -> usize {
        self.system.scheduler.ready_len()
    }

    /// The interrupt controller.
    pub fn interrupt_controller(&self) -> &Arc<InterruptController> {
        &self.system.controller
    }

    /// Starts a [`MonitoringService`] sampling this kernel every `interval`.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> MonitoringService {
        MonitoringService::start(self.clone(), interval)
    }

    pub(crate) fn attach_monitor(&self, handle: MonitorHandle) {
        let mut monitors = self.monitors.lock();
        if self.shut_down.load() {
            monitors.unlock();
            handle.halt();
        } else {
            monitors.push(handle);
            monitors.unlock();
        }
    }

    /// Returns `true` once [`Kernel::shutdown`] ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load()
    }

    /// Stops monitoring and the device workers. Idempotent; also done on
    /// drop.
    ///
    /// Once this returns, no monitoring sample is taken or delivered.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true) {
            return;
        }
        let monitors = self.monitors.with(core::mem::take);
        for monitor in &monitors {
            monitor.halt();
        }
        self.system.devices.stop_all();
        log::info!("Kernel: shut down at cycle {}.", self.cycles());
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instruction::Instruction,
        process::{ProcessState, Register},
        thread::SchedulerKind,
    };

    fn kernel(cores: usize) -> Arc<Kernel> {
        Kernel::initialize(
            SystemConfiguration::builder()
                .cores(cores)
                .quantum(10)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn initialize_rejects_invalid_configuration() {
        let configuration = SystemConfiguration {
            cores: 0,
            ..Default::default()
        };
        assert!(matches!(
            Kernel::initialize(configuration),
            Err(KernelError::InvalidArgument)
        ));
    }

    #[test]
    fn idle_processes_start_on_every_core() {
        let kernel = kernel(3);
        assert!(kernel.process_ids().is_empty());
        for core in 0..3 {
            let idle = kernel.idle_process(core).unwrap();
            assert_eq!(idle.pid, core as Pid);
            assert_eq!(kernel.core_counters()[core].current, idle.pid);
        }
        assert!(kernel.idle_process(3).is_none());
    }

    #[test]
    fn pids_are_unique_and_priorities_checked() {
        let kernel = kernel(2);
        let program = Program::new("p", vec![Instruction::exit()]);
        let a = kernel.create_process(program.clone(), 10).unwrap();
        let b = kernel.create_process(program.clone(), 10).unwrap();
        assert_eq!((a, b), (2, 3));
        assert_eq!(
            kernel.create_process(program.clone(), MAX_PRIORITY + 1),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.create_process(program, MIN_PRIORITY - 1),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(kernel.process_ids(), vec![a, b]);
        assert_eq!(kernel.process(a).unwrap().state(), ProcessState::Ready);
        assert_eq!(kernel.ready_processes(), 2);
    }

    #[test]
    fn program_registers_seed_the_context() {
        let kernel = kernel(1);
        let program = Program::new("p", vec![Instruction::exit()]).with_register(Register::R6, 99);
        let pid = kernel.create_process(program, 10).unwrap();
        let context = kernel.process(pid).unwrap().context();
        assert_eq!(context.regs[Register::R6], 99);
        assert_eq!(context.pc, 0);
        assert_eq!(context.sp, STACK_TOP);
    }

    #[test]
    fn only_terminated_processes_are_removed() {
        let kernel = kernel(1);
        let program = Program::new("p", vec![Instruction::exit()]);
        let pid = kernel.create_process(program, 10).unwrap();
        assert_eq!(kernel.remove_process(pid).err(), Some(KernelError::Busy));
        assert_eq!(
            kernel.remove_process(42).err(),
            Some(KernelError::NoSuchProcess(42))
        );
        kernel.run(40).unwrap();
        assert!(kernel.process(pid).unwrap().is_terminated());
        assert_eq!(kernel.remove_process(pid).unwrap().pid, pid);
        assert_eq!(
            kernel.process(pid).err(),
            Some(KernelError::NoSuchProcess(pid))
        );
    }

    #[test]
    fn cycles_follow_ticks() {
        let kernel = kernel(2);
        kernel.run(7).unwrap();
        assert_eq!(kernel.cycles(), 7);
        for counters in kernel.core_counters() {
            assert_eq!(counters.total, 7);
        }
    }

    #[test]
    fn scheduler_kind_is_configurable() {
        let kernel = Kernel::initialize(
            SystemConfiguration::builder()
                .scheduler(SchedulerKind::Priority)
                .build()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(kernel.configuration().scheduler, SchedulerKind::Priority);
        kernel.shutdown();
        kernel.shutdown();
    }
}
