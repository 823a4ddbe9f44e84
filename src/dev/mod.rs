//! Devices.
//!
//! Two kinds of devices are simulated:
//! - [`TimerDevice`]: the local timer of a core, driven by the clock.
//! - [`IoDevice`]: an asynchronous multi-channel device served by background
//!   workers.
//!
//! I/O devices are kept in a [`DeviceTable`] indexed by [`DeviceId`]. Ids are
//! allocated from zero in registration order and select the completion
//! vector of the device (see [`Vector::for_device`]).
//!
//! [`TimerDevice`]: timer::TimerDevice
//! [`IoDevice`]: io::IoDevice

pub mod io;
pub mod timer;

use crate::{
    KernelError,
    interrupt::{InterruptController, Vector},
    sync::SpinLock,
};
use core::time::Duration;
use io::IoDevice;
use std::sync::Arc;

/// Identifier of an I/O device.
pub type DeviceId = usize;

/// The registered I/O devices.
pub struct DeviceTable {
    devices: SpinLock<Vec<Arc<IoDevice>>>,
}

impl DeviceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            devices: SpinLock::new(Vec::new()),
        }
    }

    /// Registers and starts a new device.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `channels` is zero.
    /// - [`KernelError::NoSpace`] if every device vector is taken.
    pub fn register(
        &self,
        name: &str,
        base_latency: u64,
        channels: usize,
        tick_duration: Duration,
        controller: Arc<InterruptController>,
    ) -> Result<Arc<IoDevice>, KernelError> {
        if channels == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut devices = self.devices.lock();
        let id = devices.len();
        let Some(vector) = Vector::for_device(id) else {
            devices.unlock();
            return Err(KernelError::NoSpace);
        };
        let device = Arc::new(IoDevice::new(
            id,
            name,
            vector,
            base_latency,
            channels,
            tick_duration,
            controller,
        ));
        devices.push(device.clone());
        devices.unlock();
        log::info!(
            "Devices: registered {} as device {} ({} channel(s), {} tick(s) per unit, vector {}).",
            device.name(),
            id,
            device.channels(),
            device.base_latency(),
            device.vector()
        );
        Ok(device)
    }

    /// Returns device `id`.
    pub fn get(&self, id: DeviceId) -> Option<Arc<IoDevice>> {
        self.devices.with(|devices| devices.get(id).cloned())
    }

    /// Returns every registered device, ordered by id.
    pub fn all(&self) -> Vec<Arc<IoDevice>> {
        self.devices.with(|devices| devices.clone())
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.with(|devices| devices.len())
    }

    /// Returns `true` if no device is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the workers of every device.
    pub fn stop_all(&self) {
        for device in self.all() {
            device.stop();
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_registration_order() {
        let table = DeviceTable::new();
        let controller = Arc::new(InterruptController::new(1));
        let tick = Duration::from_millis(1);
        assert_eq!(
            table.register("none", 1, 0, tick, controller.clone()).err(),
            Some(KernelError::InvalidArgument)
        );
        let disk = table.register("disk", 1, 1, tick, controller.clone()).unwrap();
        let nic = table.register("nic", 3, 2, tick, controller).unwrap();
        assert_eq!((nic.base_latency(), nic.channels()), (3, 2));
        assert_eq!((disk.id(), disk.vector()), (0, Vector(33)));
        assert_eq!((nic.id(), nic.vector()), (1, Vector(34)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).map(|d| d.name().to_owned()), Some("nic".into()));
        assert!(table.get(2).is_none());
        table.stop_all();
    }

    #[test]
    fn vector_space_is_bounded() {
        let table = DeviceTable::new();
        let controller = Arc::new(InterruptController::new(1));
        let tick = Duration::from_millis(1);
        for _ in 0..Vector::MAX_DEVICES {
            table.register("dev", 1, 1, tick, controller.clone()).unwrap();
        }
        assert_eq!(
            table.register("dev", 1, 1, tick, controller).err(),
            Some(KernelError::NoSpace)
        );
        table.stop_all();
    }
}
