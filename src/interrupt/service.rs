//! Interrupt service routines.
//!
//! When a core fetches a pending vector, it asks the [`InterruptService`] for
//! the routine servicing it. A routine is a micro-op sequence of the form
//! ```text
//! [IrqEntry, <handler body>, IrqExit]
//! ```
//! whose body comes from the first registered [`InterruptHandler`] that
//! claims the vector. Handlers are consulted in registration order, so a new
//! handler never shadows an existing one; it is appended to the chain.
//!
//! The default chain is:
//! 1. [`TimerInterruptHandler`]: preempts the running process.
//! 2. [`IoInterruptHandler`]: wakes up the processes whose I/O completed.
//! 3. [`ExceptionHandler`]: reschedules the core after an exception.

use super::Vector;
use crate::{KernelError, dev::DeviceTable, instruction::MicroOp, sync::SpinLock};
use std::sync::Arc;

/// A source of interrupt service routine bodies.
pub trait InterruptHandler: Send + Sync {
    /// Returns `true` if this handler services `vector`.
    fn can_handle(&self, vector: Vector) -> bool;

    /// Returns the body of the routine servicing `vector`.
    fn body(&self, vector: Vector) -> Vec<MicroOp>;
}

/// Services the local timer by switching context.
pub struct TimerInterruptHandler;

impl InterruptHandler for TimerInterruptHandler {
    fn can_handle(&self, vector: Vector) -> bool {
        vector == Vector::TIMER
    }

    fn body(&self, _vector: Vector) -> Vec<MicroOp> {
        vec![MicroOp::SwitchContext]
    }
}

/// Services device completion vectors by re-admitting the device's waiters.
pub struct IoInterruptHandler {
    devices: Arc<DeviceTable>,
}

impl IoInterruptHandler {
    /// Creates a handler for the devices of `devices`.
    pub fn new(devices: Arc<DeviceTable>) -> Self {
        Self { devices }
    }
}

impl InterruptHandler for IoInterruptHandler {
    fn can_handle(&self, vector: Vector) -> bool {
        vector
            .device()
            .is_some_and(|id| self.devices.get(id).is_some())
    }

    fn body(&self, vector: Vector) -> Vec<MicroOp> {
        vector
            .device()
            .map(|device| vec![MicroOp::IoHandler { device }])
            .unwrap_or_default()
    }
}

/// Services exceptions by rescheduling the faulting core.
pub struct ExceptionHandler;

impl InterruptHandler for ExceptionHandler {
    fn can_handle(&self, vector: Vector) -> bool {
        vector.is_exception()
    }

    fn body(&self, vector: Vector) -> Vec<MicroOp> {
        log::warn!("Interrupt: exception {}; rescheduling.", vector);
        vec![MicroOp::SwitchContext]
    }
}

/// Builds interrupt service routines from an ordered handler chain.
pub struct InterruptService {
    handlers: SpinLock<Vec<Arc<dyn InterruptHandler>>>,
}

impl InterruptService {
    /// Creates a service with an empty handler chain.
    pub fn new() -> Self {
        Self {
            handlers: SpinLock::new(Vec::new()),
        }
    }

    /// Creates a service with the default handler chain.
    pub fn with_default_handlers(devices: Arc<DeviceTable>) -> Self {
        let service = Self::new();
        service.register(TimerInterruptHandler);
        service.register(IoInterruptHandler::new(devices));
        service.register(ExceptionHandler);
        service
    }

    /// Appends `handler` to the chain.
    pub fn register(&self, handler: impl InterruptHandler + 'static) {
        self.handlers.with(|handlers| handlers.push(Arc::new(handler)));
    }

    /// Builds the routine servicing `vector`.
    ///
    /// # Errors
    /// - [`KernelError::UnhandledInterrupt`] if no handler claims `vector`.
    pub fn build_isr(&self, vector: Vector) -> Result<Vec<MicroOp>, KernelError> {
        let guard = self.handlers.lock();
        let handler = guard.iter().find(|h| h.can_handle(vector)).cloned();
        guard.unlock();

        let handler = handler.ok_or(KernelError::UnhandledInterrupt(vector.0))?;
        let mut isr = vec![MicroOp::IrqEntry];
        isr.extend(handler.body(vector));
        isr.push(MicroOp::IrqExit);
        Ok(isr)
    }
}

impl Default for InterruptService {
    fn default() -> Self {
        Self::new()
    }
}
