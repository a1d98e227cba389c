//! Intermediate storage for one run.
//!
//! During the map phase every emitted pair lands in one of `R` partitions,
//! each a key-ordered multi-map behind its own mutex. Once mapping is done
//! the store is sealed and each partition is frozen into a
//! [`SortedPartition`] that a single reducer thread walks with a [`Cursor`].

use crate::{KeyValue, Partitioner};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

type Bucket = BTreeMap<Bytes, Vec<Bytes>>;

pub struct PartitionStore {
    partitions: Vec<Mutex<Bucket>>,
    partitioner: Partitioner,
    sealed: AtomicBool,
    accepted: AtomicUsize,
    dropped: AtomicUsize,
}

impl PartitionStore {
    /// Creates `num_partitions` empty partitions.
    ///
    /// # Panics
    ///
    /// Panics if `num_partitions` is zero.
    pub fn new(num_partitions: usize, partitioner: Partitioner) -> Self {
        assert!(num_partitions > 0, "a store needs at least one partition");
        Self {
            partitions: (0..num_partitions).map(|_| Mutex::default()).collect(),
            partitioner,
            sealed: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// The partition `key` is routed to.
    pub fn partition_of(&self, key: &[u8]) -> usize {
        (self.partitioner)(key, self.partitions.len()) % self.partitions.len()
    }

    fn insert(&self, key: &[u8], value: &[u8]) {
        if key.is_empty() {
            trace!("dropping pair with empty key");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.sealed.load(Ordering::Acquire) {
            warn!("dropping pair emitted after the map phase ended");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        let idx = self.partition_of(&key);
        self.partitions[idx]
            .lock()
            .expect("partition lock poisoned")
            .entry(key)
            .or_default()
            .push(value);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of pairs stored so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Number of pairs rejected (empty key, or emitted after sealing).
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ends the map phase: later emits are dropped, and the contents of every
    /// partition are moved out in ascending key order.
    pub fn seal(&self) -> Vec<SortedPartition> {
        self.sealed.store(true, Ordering::Release);
        self.partitions
            .iter()
            .enumerate()
            .map(|(index, bucket)| {
                let mut bucket = bucket.lock().expect("partition lock poisoned");
                SortedPartition::from_bucket(index, std::mem::take(&mut *bucket))
            })
            .collect()
    }
}

/// Handle through which map functions hand pairs to the engine.
///
/// Cloning is cheap; all clones feed the same run.
#[derive(Clone)]
pub struct Emitter {
    store: Arc<PartitionStore>,
}

impl Emitter {
    pub fn new(store: Arc<PartitionStore>) -> Self {
        Self { store }
    }

    /// Stores a copy of `(key, value)` in the partition `key` hashes to.
    ///
    /// Pairs with an empty key are silently ignored.
    pub fn emit(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.store.insert(key.as_ref(), value.as_ref());
    }

    /// Number of partitions in the current run.
    pub fn num_partitions(&self) -> usize {
        self.store.num_partitions()
    }
}

/// The frozen contents of one partition, in ascending key order.
#[derive(Debug)]
pub struct SortedPartition {
    index: usize,
    entries: Vec<KeyValue>,
}

impl SortedPartition {
    fn from_bucket(index: usize, bucket: Bucket) -> Self {
        let entries = bucket
            .into_iter()
            .flat_map(|(key, values)| {
                values
                    .into_iter()
                    .map(move |value| KeyValue::new(key.clone(), value))
            })
            .collect();
        Self { index, entries }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Total number of pairs, counting every value of every key.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            partition: self,
            pos: 0,
        }
    }
}

/// Read position within a [`SortedPartition`].
///
/// Owned by the one reducer thread that processes the partition.
#[derive(Debug)]
pub struct Cursor<'a> {
    partition: &'a SortedPartition,
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Index of the partition being read.
    pub fn partition(&self) -> usize {
        self.partition.index
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.partition.entries.len()
    }

    /// Key of the entry under the cursor.
    pub fn peek_key(&self) -> Option<&'a Bytes> {
        self.partition.entries.get(self.pos).map(|kv| &kv.key)
    }

    /// Moves past the current entry. No-op at the end.
    pub fn advance(&mut self) {
        if !self.at_end() {
            self.pos += 1;
        }
    }

    /// Returns the next value for `key` and advances, or `None` once the
    /// cursor has moved past `key`'s values.
    ///
    /// This never searches: if the entry under the cursor has another key,
    /// the cursor stays put and `None` is returned.
    pub fn get_next(&mut self, key: &[u8]) -> Option<Bytes> {
        let entry = self.partition.entries.get(self.pos)?;
        if entry.key.as_ref() != key {
            return None;
        }
        self.pos += 1;
        Some(entry.value())
    }

    /// Iterator over the remaining values of `key`.
    pub fn values<'c>(&'c mut self, key: &'c [u8]) -> Values<'c, 'a> {
        Values { cursor: self, key }
    }

    /// Skips every remaining entry for `key`, returning how many were skipped.
    pub fn skip_key(&mut self, key: &[u8]) -> usize {
        let mut skipped = 0;
        while self.get_next(key).is_some() {
            skipped += 1;
        }
        skipped
    }
}

/// Pulls one key's values out of a [`Cursor`]. See [`Cursor::values`].
pub struct Values<'c, 'a> {
    cursor: &'c mut Cursor<'a>,
    key: &'c [u8],
}

impl Iterator for Values<'_, '_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.cursor.get_next(self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition;
    use itertools::Itertools;
    use std::thread;

    fn store(n: usize) -> Arc<PartitionStore> {
        Arc::new(PartitionStore::new(n, partition))
    }

    #[test]
    fn emitted_pairs_are_read_back_per_key() {
        let store = store(4);
        let emitter = Emitter::new(Arc::clone(&store));
        emitter.emit("cat", "1");
        emitter.emit("cat", "2");
        emitter.emit("dog", "9");

        let p = store.partition_of(b"cat");
        let partitions = store.seal();
        let mut cursor = partitions[p].cursor();
        assert_eq!(cursor.peek_key().map(|k| &k[..]), Some(&b"cat"[..]));
        assert_eq!(cursor.get_next(b"cat"), Some(Bytes::from("1")));
        assert_eq!(cursor.get_next(b"cat"), Some(Bytes::from("2")));
        assert_eq!(cursor.get_next(b"cat"), None);
    }

    #[test]
    fn empty_key_is_dropped() {
        let store = store(3);
        let emitter = Emitter::new(Arc::clone(&store));
        emitter.emit("", "value");
        emitter.emit("k", "v");
        assert_eq!(store.accepted(), 1);
        assert_eq!(store.dropped(), 1);
        let total: usize = store.seal().iter().map(SortedPartition::len).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn emit_after_seal_is_dropped() {
        let store = store(2);
        let emitter = Emitter::new(Arc::clone(&store));
        emitter.emit("a", "1");
        let sealed = store.seal();
        emitter.emit("a", "2");
        assert_eq!(sealed.iter().map(SortedPartition::len).sum::<usize>(), 1);
        assert_eq!(store.dropped(), 1);
    }

    #[test]
    fn mismatched_key_does_not_advance() {
        let store = store(1);
        let emitter = Emitter::new(Arc::clone(&store));
        emitter.emit("apple", "x");
        emitter.emit("pear", "y");
        let partitions = store.seal();
        let mut cursor = partitions[0].cursor();

        assert_eq!(cursor.get_next(b"pear"), None);
        assert_eq!(cursor.get_next(b"zebra"), None);
        assert_eq!(cursor.get_next(b"apple"), Some(Bytes::from("x")));
        assert_eq!(cursor.get_next(b"pear"), Some(Bytes::from("y")));
        assert!(cursor.at_end());
        assert_eq!(cursor.get_next(b"pear"), None);
    }

    #[test]
    fn keys_come_out_sorted() {
        let store = store(1);
        let emitter = Emitter::new(Arc::clone(&store));
        for key in ["delta", "alpha", "charlie", "bravo", "alpha"] {
            emitter.emit(key, "1");
        }
        let partitions = store.seal();
        let mut cursor = partitions[0].cursor();
        let mut keys = Vec::new();
        while let Some(key) = cursor.peek_key() {
            keys.push(key.clone());
            cursor.advance();
        }
        assert_eq!(
            keys,
            vec!["alpha", "alpha", "bravo", "charlie", "delta"]
                .into_iter()
                .map(Bytes::from)
                .collect::<Vec<_>>()
        );
        cursor.advance();
        assert!(cursor.at_end());
    }

    #[test]
    fn skip_key_stops_at_next_key() {
        let store = store(1);
        let emitter = Emitter::new(Arc::clone(&store));
        for v in 0..5 {
            emitter.emit("a", v.to_string());
        }
        emitter.emit("b", "last");
        let partitions = store.seal();
        let mut cursor = partitions[0].cursor();
        assert_eq!(cursor.get_next(b"a"), Some(Bytes::from("0")));
        assert_eq!(cursor.skip_key(b"a"), 4);
        assert_eq!(cursor.values(b"b").collect::<Vec<_>>(), vec![Bytes::from("last")]);
        assert!(cursor.at_end());
    }

    #[test]
    fn concurrent_emits_are_all_stored_once() {
        let store = store(5);
        let handles = (0..8)
            .map(|t| {
                let emitter = Emitter::new(Arc::clone(&store));
                thread::spawn(move || {
                    for i in 0..250 {
                        emitter.emit(format!("key-{}", i % 37), format!("{}-{}", t, i));
                    }
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().unwrap());

        assert_eq!(store.accepted(), 2000);
        let partitions = store.seal();
        assert_eq!(partitions.iter().map(SortedPartition::len).sum::<usize>(), 2000);

        let mut seen = Vec::new();
        for part in &partitions {
            let mut cursor = part.cursor();
            while let Some(key) = cursor.peek_key() {
                assert_eq!(store.partition_of(key), part.index());
                for value in cursor.values(key) {
                    seen.push(value);
                }
            }
        }
        // every value is unique, so duplicates would show up here
        assert_eq!(seen.iter().unique().count(), 2000);
    }

    #[test]
    fn same_key_routes_to_same_partition() {
        let store = store(7);
        let emitter = Emitter::new(Arc::clone(&store));
        emitter.emit("repeat", "1");
        emitter.emit("repeat", "2");
        let partitions = store.seal();
        let non_empty = partitions.iter().filter(|p| !p.is_empty()).collect::<Vec<_>>();
        assert_eq!(non_empty.len(), 1);
        assert_eq!(non_empty[0].len(), 2);
        assert_eq!(non_empty[0].index(), partition(b"repeat", 7));
    }

    #[test]
    fn out_of_range_partitioner_is_clamped() {
        fn wild(_: &[u8], n: usize) -> usize {
            n + 3
        }
        let store = PartitionStore::new(4, wild);
        assert_eq!(store.partition_of(b"x"), 3);
    }
}
