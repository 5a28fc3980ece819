//! Fault-injection hook points.
//!
//! A trait with a production no-op implementation and a test implementation
//! that can be armed to fail at a labelled scenario number. The scenario
//! numbers identify specific points inside `insert`/`remove`/`clear` and
//! must never be renumbered -- they are the crash-recovery test suite's
//! vocabulary, not an implementation detail.

/// A hook invoked at every labelled step of `insert`/`remove`/`clear`.
///
/// The production implementation (`NoCrash`) costs nothing: the trait
/// object call is the only overhead, and `hit` does nothing. Tests arm a
/// `ChaosMonkey` to panic at a chosen scenario, simulating the writing
/// process being killed mid-operation; the next `PersistentMap::open` on
/// the same files then exercises `table::recover`.
pub trait CrashPoint: Send + Sync {
    /// Called at scenario `scenario`. Implementations that want to
    /// simulate a crash should panic (or, out-of-process, `abort`/`exit`).
    fn hit(&self, scenario: u32);
}

/// The default, production `CrashPoint`: always a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCrash;

impl CrashPoint for NoCrash {
    #[inline(always)]
    fn hit(&self, _scenario: u32) {}
}

/// Exposed to integration tests (`tests/`) under the `chaos` feature, since
/// `#[cfg(test)]` alone is only visible within this crate's own unit tests --
/// a separate `tests/*.rs` binary links against the normal (non-`cfg(test)`)
/// build of this library.
#[cfg(any(test, feature = "chaos"))]
pub mod chaos {
    //! A `CrashPoint` usable by tests and by other crates exercising crash
    //! equivalence in-process, kept separate from the main trait so that
    //! non-test builds never pull in `std::sync::atomic` bookkeeping for
    //! scenario matching.
    use super::CrashPoint;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Panics the first time `hit` is called with the armed scenario.
    pub struct ChaosMonkey {
        armed: AtomicU32,
    }

    impl ChaosMonkey {
        pub fn new(scenario: u32) -> Self {
            ChaosMonkey {
                armed: AtomicU32::new(scenario),
            }
        }

        /// A monkey that never fires; useful as a placeholder in table
        /// construction before arming a real scenario.
        pub fn disarmed() -> Self {
            ChaosMonkey {
                armed: AtomicU32::new(0),
            }
        }
    }

    impl CrashPoint for ChaosMonkey {
        fn hit(&self, scenario: u32) {
            if scenario != 0 && self.armed.load(Ordering::Relaxed) == scenario {
                // Disarm before panicking so recovery's own re-entrant call
                // into the same operation (if any) doesn't loop forever.
                self.armed.store(0, Ordering::Relaxed);
                panic!("pmap: chaos monkey fired at scenario {}", scenario);
            }
        }
    }
}
