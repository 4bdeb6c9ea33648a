//! Result cache shared by every plan in the process.
//!
//! Entries are keyed by a [`Fingerprint`] of the operation kind and its
//! normalized input. Concurrent misses on one fingerprint share a single
//! computation.

pub mod cache;
pub mod fingerprint;

pub use cache::{CacheStats, ResultCache};
pub use fingerprint::Fingerprint;
