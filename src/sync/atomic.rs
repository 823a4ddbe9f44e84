//! A wrapper around the core::sync::atomic.
//!
//! The kernel keeps a large number of statistics counters: cycle counters per
//! core, per-process cycle accounts, per-channel request counts. Each counter
//! has a single writer (the owning core on the tick thread, or the owning device
//! worker) and is read by the monitoring sampler without further
//! synchronization. The wrappers here fix the memory ordering so that call
//! sites read as plain loads, stores and increments.
//!
//! Counters use relaxed ordering: a sampler may observe a value that is a few
//! increments stale, which is acceptable for display-only statistics.
//! [`AtomicBool`] uses sequentially consistent ordering because it is used for
//! control flags (e.g. stopping device workers).

use core::sync::atomic::Ordering;

/// A boolean type which can be safely shared between threads.
#[derive(Default)]
pub struct AtomicBool(core::sync::atomic::AtomicBool);

impl AtomicBool {
    /// Creates a new `AtomicBool`.
    #[inline]
    #[must_use]
    pub const fn new(v: bool) -> AtomicBool {
        Self(core::sync::atomic::AtomicBool::new(v))
    }

    /// Loads a value from the bool.
    #[inline]
    pub fn load(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stores a value into the bool.
    #[inline]
    pub fn store(&self, val: bool) {
        self.0.store(val, Ordering::SeqCst)
    }

    /// Stores a value into the bool, returning the previous value.
    #[inline]
    pub fn swap(&self, val: bool) -> bool {
        self.0.swap(val, Ordering::SeqCst)
    }
}

impl core::fmt::Debug for AtomicBool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.load(), f)
    }
}

macro_rules! atomic_counter {
    ($(#[$attr:meta])* $atomic_type:ident, $int_type:ty) => {
        $(#[$attr])*
        #[derive(Default)]
        pub struct $atomic_type(core::sync::atomic::$atomic_type);

        impl core::fmt::Debug for $atomic_type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Debug::fmt(&self.load(), f)
            }
        }

        impl $atomic_type {
            #[doc = concat!("Creates a new `", stringify!($atomic_type), "`.")]
            #[inline]
            #[must_use]
            pub const fn new(v: $int_type) -> Self {
                Self(core::sync::atomic::$atomic_type::new(v))
            }

            /// Loads the current value.
            #[inline]
            pub fn load(&self) -> $int_type {
                self.0.load(Ordering::Relaxed)
            }

            /// Stores a value.
            #[inline]
            pub fn store(&self, val: $int_type) {
                self.0.store(val, Ordering::Relaxed)
            }

            /// Adds to the current value, returning the previous value.
            ///
            /// This operation wraps around on overflow.
            #[inline]
            pub fn fetch_add(&self, val: $int_type) -> $int_type {
                self.0.fetch_add(val, Ordering::Relaxed)
            }

            /// Increments the value by one.
            #[inline]
            pub fn increment(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
}

atomic_counter!(
    /// An unsigned 64-bit counter which can be safely shared between threads.
    AtomicU64,
    u64
);
atomic_counter!(
    /// A signed 64-bit value which can be safely shared between threads.
    AtomicI64,
    i64
);
atomic_counter!(
    /// A pointer-sized unsigned value which can be safely shared between
    /// threads.
    AtomicUsize,
    usize
);
