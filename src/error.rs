//! The error taxonomy of the persistent map.
//!
//! One flat `quick_error!` enum of error *kinds*, each carrying just enough
//! payload to explain itself without the caller having to dig through
//! header bytes again.

use std::io;

quick_error! {
    /// An error produced by a `PersistentMap` operation.
    #[derive(Debug)]
    pub enum Error {
        /// The requested key is not present (for indexed/`index` reads).
        NotFound {
            description("key not found")
        }
        /// `add` was called on a key that is already present.
        DuplicateKey {
            description("key already present")
        }
        /// The caller passed a missing key where a key is required, e.g.
        /// `None::<K>` for a key type implementing
        /// [`NullableKey`](crate::NullableKey).
        NullKey {
            description("null key")
        }
        /// Another live process holds the write lock and the spin/escalation
        /// budget was exhausted.
        LockHeld {
            /// The PID observed holding the lock.
            pid: i32,
        } {
            description("write lock held by a live process")
            display("write lock held by pid {}", pid)
        }
        /// The enumerator observed the version counter advance mid-iteration.
        ConcurrentlyModified {
            description("map was concurrently modified during iteration")
        }
        /// Recovery encountered a state it cannot reconcile, such as an
        /// unknown recovery-flag bit.
        Corrupt(detail: String) {
            description("on-disk state is corrupt")
            display("corrupt on-disk state: {}", detail)
        }
        /// The release-time lock CAS observed a different holder than
        /// expected. The process must fail-fast; this is not recoverable
        /// within the process.
        Fatal(detail: String) {
            description("fatal lock invariant violation")
            display("fatal: {}", detail)
        }
        /// Growing or mapping the backing files failed.
        Io(err: io::Error) {
            from()
            description("I/O error")
            display("I/O error: {}", err)
            cause(err)
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
