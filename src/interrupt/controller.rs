//! Per-core interrupt delivery.
//!
//! The controller plays the role of the local APICs and the I/O APIC of a
//! multiprocessor. Each core owns a FIFO of pending vectors. A *local*
//! interrupt targets one core; an *external* interrupt is delivered to a core
//! chosen uniformly at random among the cores listed in the vector's
//! redirection entry, or among all cores if the vector has none.
//!
//! Raising is lock-free and may happen from any thread (device workers raise
//! completions). Fetching is done by the owning core on the tick thread.

use super::Vector;
use crate::{KernelError, process::CoreId, sync::SpinLock};
use crossbeam_queue::SegQueue;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::BTreeMap;

/// Routes raised vectors to the pending queues of the cores.
pub struct InterruptController {
    pending: Vec<SegQueue<Vector>>,
    redirection: SpinLock<BTreeMap<Vector, Vec<CoreId>>>,
    rng: SpinLock<StdRng>,
}

impl InterruptController {
    /// Creates a controller for `cores` cores, seeding the core selection
    /// from the operating system.
    pub fn new(cores: usize) -> Self {
        Self::with_seed(cores, None)
    }

    /// Creates a controller for `cores` cores. A `seed` makes the delivery of
    /// external interrupts reproducible.
    pub fn with_seed(cores: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            pending: (0..cores).map(|_| SegQueue::new()).collect(),
            redirection: SpinLock::new(BTreeMap::new()),
            rng: SpinLock::new(rng),
        }
    }

    /// Number of cores served.
    pub fn cores(&self) -> usize {
        self.pending.len()
    }

    /// Raises `vector` on `core`.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `core` does not exist.
    pub fn raise_local(&self, vector: Vector, core: CoreId) -> Result<(), KernelError> {
        let queue = self.pending.get(core).ok_or(KernelError::InvalidArgument)?;
        queue.push(vector);
        Ok(())
    }

    /// Raises `vector` on a core picked by the redirection table, and returns
    /// that core.
    pub fn raise_external(&self, vector: Vector) -> CoreId {
        let core = self.route(vector);
        self.pending[core].push(vector);
        log::trace!("Interrupt: {} delivered to core {}.", vector, core);
        core
    }

    fn route(&self, vector: Vector) -> CoreId {
        let targets = self.redirection.with(|table| table.get(&vector).cloned());
        let mut rng = self.rng.lock();
        let core = match targets {
            Some(cores) => cores[rng.gen_range(0..cores.len())],
            None => rng.gen_range(0..self.pending.len()),
        };
        rng.unlock();
        core
    }

    /// Dequeues the oldest pending vector of `core`, if any.
    pub fn fetch_ready(&self, core: CoreId) -> Option<Vector> {
        self.pending.get(core)?.pop()
    }

    /// Number of vectors pending on `core`.
    pub fn pending(&self, core: CoreId) -> usize {
        self.pending.get(core).map_or(0, SegQueue::len)
    }

    /// Restricts the delivery of `vector` to `cores`.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `cores` is empty or names a core
    ///   that does not exist.
    pub fn set_redirection(&self, vector: Vector, cores: &[CoreId]) -> Result<(), KernelError> {
        if cores.is_empty() || cores.iter().any(|&core| core >= self.pending.len()) {
            return Err(KernelError::InvalidArgument);
        }
        self.redirection
            .with(|table| table.insert(vector, cores.to_vec()));
        Ok(())
    }

    /// Lets `vector` be delivered to any core again.
    pub fn clear_redirection(&self, vector: Vector) {
        self.redirection.with(|table| table.remove(&vector));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_interrupts_are_fifo_per_core() {
        let controller = InterruptController::new(2);
        controller.raise_local(Vector::TIMER, 1).unwrap();
        controller.raise_local(Vector(40), 1).unwrap();
        assert_eq!(controller.fetch_ready(0), None);
        assert_eq!(controller.pending(1), 2);
        assert_eq!(controller.fetch_ready(1), Some(Vector::TIMER));
        assert_eq!(controller.fetch_ready(1), Some(Vector(40)));
        assert_eq!(controller.fetch_ready(1), None);
        assert_eq!(
            controller.raise_local(Vector::TIMER, 2),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn redirection_restricts_external_delivery() {
        let controller = InterruptController::with_seed(4, Some(7));
        controller.set_redirection(Vector(33), &[2]).unwrap();
        for _ in 0..16 {
            assert_eq!(controller.raise_external(Vector(33)), 2);
        }
        assert_eq!(controller.pending(2), 16);
        assert_eq!(
            controller.set_redirection(Vector(33), &[4]),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            controller.set_redirection(Vector(33), &[]),
            Err(KernelError::InvalidArgument)
        );
        controller.clear_redirection(Vector(33));
        let mut seen = [false; 4];
        for _ in 0..256 {
            seen[controller.raise_external(Vector(33))] = true;
        }
        assert!(seen.iter().all(|&hit| hit));
    }
}
