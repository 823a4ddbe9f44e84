//! Process scheduling and dispatching.
//!
//! The [`Scheduler`] decides which process runs next on a core; the
//! [`Dispatcher`] performs the switch. Two schedulers are provided and
//! selected by [`SchedulerKind`]:
//! - [`RoundRobin`]: a shared FIFO run queue.
//! - [`Priority`]: a priority heap with aging.
//!
//! [`RoundRobin`]: round_robin::RoundRobin
//! [`Priority`]: priority::Priority

pub mod dispatcher;
pub mod priority;
pub mod round_robin;
pub mod scheduler;

pub use dispatcher::Dispatcher;
pub use scheduler::{Scheduler, SchedulerKind};
