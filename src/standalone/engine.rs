use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use std::{fs, path::Path, sync::Arc, thread, time::Instant};
use tracing::{debug, info, trace};

use crate::partition::{Cursor, Emitter, PartitionStore, SortedPartition};
use crate::pool::{panic_message, ThreadPool};
use crate::standalone::Job;

/// What happened during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Input files handed to the map function.
    pub files: usize,
    /// Pairs stored by the map phase.
    pub emitted: usize,
    /// Pairs ignored, either because their key was empty or because they
    /// were emitted after the map phase ended.
    pub dropped: usize,
    /// Stored pairs per partition, indexed by partition.
    pub partition_sizes: Vec<usize>,
    /// Number of reduce invocations, i.e. distinct keys across all partitions.
    pub keys_reduced: usize,
}

/// Runs `map_fn` over every file on `num_mappers` threads, then `reduce_fn`
/// once per distinct key on `num_reducers` partitions.
///
/// Blocks until both phases are done. Fails without starting any thread if
/// there are no files or either count is zero.
pub fn run<P, M, R>(
    files: &[P],
    map_fn: M,
    num_mappers: usize,
    reduce_fn: R,
    num_reducers: usize,
) -> Result<RunStats>
where
    P: AsRef<Path>,
    M: Fn(&Path, &Emitter) + Send + Sync + 'static,
    R: Fn(Bytes, &mut Cursor<'_>, usize) + Sync,
{
    let job = Job::new(files.iter().map(|f| f.as_ref().to_path_buf()))
        .mappers(num_mappers)
        .reducers(num_reducers);
    run_job(&job, map_fn, reduce_fn)
}

/// Like [`run`], configured by a [`Job`].
pub fn run_job<M, R>(job: &Job, map_fn: M, reduce_fn: R) -> Result<RunStats>
where
    M: Fn(&Path, &Emitter) + Send + Sync + 'static,
    R: Fn(Bytes, &mut Cursor<'_>, usize) + Sync,
{
    job.validate()?;

    let store = Arc::new(PartitionStore::new(job.num_reducers, job.partitioner));

    let started = Instant::now();
    perform_map(job, map_fn, &store)?;
    info!(
        files = job.files.len(),
        emitted = store.accepted(),
        dropped = store.dropped(),
        elapsed = ?started.elapsed(),
        "map phase done"
    );

    // All mappers have been joined, so nothing writes to the store anymore.
    let partitions = store.seal();
    let partition_sizes = partitions.iter().map(SortedPartition::len).collect();

    let started = Instant::now();
    let keys_reduced = perform_reduce(&partitions, &reduce_fn)?;
    info!(keys_reduced, elapsed = ?started.elapsed(), "reduce phase done");

    Ok(RunStats {
        files: job.files.len(),
        emitted: store.accepted(),
        dropped: store.dropped(),
        partition_sizes,
        keys_reduced,
    })
}

/// Queues one job per input file, largest file first, and waits for the
/// pool to drain.
fn perform_map<M>(job: &Job, map_fn: M, store: &Arc<PartitionStore>) -> Result<()>
where
    M: Fn(&Path, &Emitter) + Send + Sync + 'static,
{
    let pool = ThreadPool::new(job.num_mappers).context("failed to start map workers")?;
    let map_fn = Arc::new(map_fn);
    let emitter = Emitter::new(Arc::clone(store));

    // Every file is sized before anything is queued, and the batch goes in
    // under one lock, so the first job a worker picks is the largest.
    let jobs = job
        .files
        .iter()
        .map(|path| {
            let map_fn = Arc::clone(&map_fn);
            let emitter = emitter.clone();
            let path = path.clone();
            let priority = input_size(&path);
            let task = move || {
                trace!(path = %path.display(), "map started");
                map_fn(path.as_path(), &emitter);
            };
            (priority, task)
        })
        .collect::<Vec<_>>();
    pool.submit_all(jobs)?;

    pool.shutdown().context("map phase failed")
}

/// Scheduling priority of an input file. Unreadable files still get mapped,
/// just last.
fn input_size(path: &Path) -> u64 {
    match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            debug!(path = %path.display(), %err, "cannot stat input, scheduling it last");
            0
        }
    }
}

/// Spawns one reducer thread per partition and waits for all of them.
/// Returns the total number of keys reduced.
fn perform_reduce<R>(partitions: &[SortedPartition], reduce_fn: &R) -> Result<usize>
where
    R: Fn(Bytes, &mut Cursor<'_>, usize) + Sync,
{
    thread::scope(|scope| -> Result<usize> {
        let handles = partitions
            .iter()
            .map(|partition| {
                thread::Builder::new()
                    .name(format!("mrpool-reducer-{}", partition.index()))
                    .spawn_scoped(scope, move || reduce_partition(partition, reduce_fn))
                    .with_context(|| format!("failed to spawn reducer {}", partition.index()))
            })
            .collect::<Result<Vec<_>>>()?;

        // Join every reducer before looking at any result.
        let results = handles
            .into_iter()
            .map(|handle| handle.join().map_err(panic_message))
            .collect::<Vec<_>>();

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.with_context(|| format!("reducer for partition {} panicked", index))
            })
            .sum()
    })
}

/// Calls `reduce_fn` once per distinct key of `partition`, in key order.
fn reduce_partition<R>(partition: &SortedPartition, reduce_fn: &R) -> usize
where
    R: Fn(Bytes, &mut Cursor<'_>, usize),
{
    let mut cursor = partition.cursor();
    let mut keys = 0;
    while let Some(key) = cursor.peek_key() {
        reduce_fn(key.clone(), &mut cursor, partition.index());
        let skipped = cursor.skip_key(key);
        if skipped > 0 {
            trace!(partition = partition.index(), skipped, "reducer left values unread");
        }
        keys += 1;
    }
    debug!(partition = partition.index(), entries = partition.len(), keys, "partition reduced");
    keys
}
