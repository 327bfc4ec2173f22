//! Shared-memory interprocess cache over a memory-mapped file.
//!
//! `mmcache` lets any number of processes on one host share a bounded,
//! lossy key/value cache. The backing file is an array of fixed-size pages;
//! a dual-level hash picks the page for a key (and a starting slot inside
//! it), and each page is guarded by its own exclusive byte-range lock, so
//! contention is per page rather than per cache.
//!
//! The locking is explicit: hash a key, lock its page, run any number of
//! reads/writes/deletes against that page, unlock. This keeps a batch of
//! operations on one page to a single lock round-trip.
//!
//! ```no_run
//! use mmcache::{Cache, CacheOptions, ExpungeMode};
//!
//! # fn main() -> mmcache::Result<()> {
//! let mut cache = Cache::new(CacheOptions::new("/tmp/sharefile"))?;
//!
//! let (page, intra) = cache.hash(b"session:42");
//! cache.lock(page)?;
//! if !cache.write(intra, b"session:42", b"payload", 60, 0)?.is_stored() {
//!     // make room on the page, then retry once
//!     if let Some(plan) = cache.calc_expunge(ExpungeMode::MakeRoom, Some(7 + 9))? {
//!         cache.do_expunge(plan)?;
//!     }
//!     let _ = cache.write(intra, b"session:42", b"payload", 60, 0)?;
//! }
//! let hit = cache.read(intra, b"session:42")?.map(|(v, _flags)| v.to_vec());
//! cache.unlock()?;
//! # let _ = hit;
//! # Ok(())
//! # }
//! ```
//!
//! Entries disappear under space pressure (approximate-LRU expunge), on
//! expiry, and on explicit delete. There is no cross-host story: the file
//! layout is native-endian and only ever shared between processes of one
//! machine.

#[cfg(not(unix))]
compile_error!("mmcache needs a unix backing store (fcntl byte-range locks + mmap)");

mod error;
mod hash;
mod options;
mod shm;

pub use error::{CacheError, Result};
pub use hash::hash_key;
pub use options::CacheOptions;
pub use shm::iter::CacheIter;
pub use shm::{
    Cache, EntryView, ExpungeMode, ExpungePlan, PageStats, WriteOutcome, EXPIRE_DEFAULT,
};
