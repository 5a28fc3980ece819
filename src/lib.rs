//! A persistent, crash-consistent, single-writer/multi-reader hash map
//! backed by two memory-mapped files.
//!
//! The map is laid out as a classic chained hash table -- a bucket array of
//! indices into an entry array, entries linked into per-bucket chains --
//! except every mutating step journals a shadow copy of the field it is
//! about to overwrite into a fixed header slot before touching it. If the
//! writing process dies mid-operation, the next process to attach detects
//! the orphaned lock, steals it, and replays (or rolls back) the step the
//! recovery flags say was in flight.
//!
//! See `table::PersistentMap` for the public surface.

#[macro_use]
extern crate quick_error;

mod crash;
mod error;
mod header;
mod iter;
mod lock;
mod primes;
mod region;
mod table;

pub use crash::{CrashPoint, NoCrash};
pub use error::{Error, Result};
pub use iter::Iter;
pub use table::{DefaultHasher, KeyHasher, NullableKey, Options, PersistentMap, DEFAULT_CAPACITY};

#[cfg(any(test, feature = "chaos"))]
pub use crash::chaos::ChaosMonkey;
