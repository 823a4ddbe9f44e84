//! Interrupt management.
//!
//! Interrupts are identified by a [`Vector`]. The vector space follows the
//! x86 layout:
//!
//! | Vectors    | Source                                          |
//! |------------|-------------------------------------------------|
//! | `0..=31`   | Exceptions raised by a core (e.g. divide error) |
//! | `32`       | The local timer of a core                       |
//! | `33..=255` | I/O completion of device `vector - 33`          |
//!
//! The [`InterruptController`] routes raised vectors to per-core pending
//! queues, and the [`InterruptService`] turns a fetched vector into the
//! micro-op sequence the core executes to service it.

pub mod controller;
pub mod service;

use crate::dev::DeviceId;
use core::fmt;

pub use controller::InterruptController;
pub use service::{
    ExceptionHandler, InterruptHandler, InterruptService, IoInterruptHandler,
    TimerInterruptHandler,
};

/// An interrupt vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vector(pub u8);

impl Vector {
    /// Divide error, raised when a core divides by zero.
    pub const DIVIDE_ERROR: Vector = Vector(0);
    /// Last exception vector.
    pub const LAST_EXCEPTION: Vector = Vector(31);
    /// The local timer.
    pub const TIMER: Vector = Vector(32);
    /// Vector of the first registered device.
    pub const FIRST_DEVICE: Vector = Vector(33);
    /// Maximum number of devices that can be given a vector.
    pub const MAX_DEVICES: usize = u8::MAX as usize - Self::FIRST_DEVICE.0 as usize + 1;

    /// Returns the completion vector of device `id`, if the id fits in the
    /// vector space.
    pub fn for_device(id: DeviceId) -> Option<Vector> {
        (id < Self::MAX_DEVICES).then(|| Vector(Self::FIRST_DEVICE.0 + id as u8))
    }

    /// Returns the device whose completions this vector signals.
    pub fn device(self) -> Option<DeviceId> {
        (self >= Self::FIRST_DEVICE).then(|| (self.0 - Self::FIRST_DEVICE.0) as DeviceId)
    }

    /// Returns `true` for the exception vectors.
    pub fn is_exception(self) -> bool {
        self <= Self::LAST_EXCEPTION
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<Vector> for u8 {
    fn from(vector: Vector) -> u8 {
        vector.0
    }
}
