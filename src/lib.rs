//! A single-machine MapReduce (lite) engine.
//!
//! Users supply a map function, a reduce function and a list of input
//! files. Map invocations run on a fixed-size thread pool that schedules the
//! largest files first; emitted pairs are hashed into `R` key-ordered
//! partitions, and one reducer thread per partition walks its keys, pulling
//! each key's values on demand through a [`partition::Cursor`].

use bytes::Bytes;
use std::path::Path;

pub mod partition;
pub mod pool;
pub mod standalone;
pub mod utils;
pub mod workload;

pub use partition::{Cursor, Emitter};
pub use standalone::engine::{run, run_job, RunStats};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// A map function takes the path of one input file, the [`Emitter`] for the
/// current run, and auxiliary arguments.
///
/// Reading the file is up to the map function.
pub type MapFn = fn(path: &Path, emitter: &Emitter, aux: &Bytes) -> anyhow::Result<()>;

/// A reduce function takes in a key, the cursor positioned on that key's
/// first value, and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing a single output value.
///
/// Values are pulled with [`Cursor::get_next`]; any values left unread are
/// skipped by the engine once the function returns.
pub type ReduceFn = fn(key: Bytes, values: &mut Cursor<'_>, aux: &Bytes) -> anyhow::Result<Bytes>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/// Maps a key onto a partition index in `[0, num_partitions)`.
pub type Partitioner = fn(key: &[u8], num_partitions: usize) -> usize;

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }
}

/// Hashes an intermediate key into a reduce bucket.
///
/// This is the DJB2 string hash (`h = h * 33 + byte`, seeded with 5381)
/// taken modulo `num_partitions`. The result depends only on the key bytes
/// and the partition count.
///
/// # Panics
///
/// Panics if `num_partitions` is zero.
pub fn partition(key: &[u8], num_partitions: usize) -> usize {
    assert!(num_partitions > 0, "cannot partition into zero buckets");
    let hash = key.iter().fold(5381u64, |hash, &byte| {
        hash.wrapping_mul(33).wrapping_add(u64::from(byte))
    });
    (hash % num_partitions as u64) as usize
}
