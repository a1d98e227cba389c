//! A fixed-size thread pool with largest-job-first scheduling.
//!
//! Workers sleep on a condition variable while the queue is empty. Shutdown
//! is signalled in-band with a [`Work::Shutdown`] sentinel, so every job
//! queued before it still runs; the worker that pops the sentinel marks the
//! pool as terminating and wakes the rest.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

pub mod queue;

use queue::{Task, Work, WorkQueue};

pub struct ThreadPool {
    workers: Vec<Worker>,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    queue: WorkQueue,
    /// Set by the worker that consumed the sentinel.
    terminating: bool,
    /// Set once the sentinel has been queued; no more submissions.
    closed: bool,
    next_seq: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("thread pool lock poisoned")
    }
}

impl State {
    fn enqueue(&mut self, priority: u64, run: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Work::Task { priority, seq, run });
        trace!(priority, seq, pending = self.queue.len(), "job queued");
    }
}

impl ThreadPool {
    /// Starts `size` workers, each blocked until work arrives.
    ///
    /// Fails if `size` is zero or a thread cannot be spawned; in the latter
    /// case the workers already started are stopped before returning.
    pub fn new(size: usize) -> Result<ThreadPool> {
        if size == 0 {
            bail!("a thread pool needs at least one worker");
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: WorkQueue::new(),
                terminating: false,
                closed: false,
                next_seq: 0,
            }),
            available: Condvar::new(),
        });

        let mut pool = ThreadPool {
            workers: Vec::with_capacity(size),
            shared,
        };
        for id in 0..size {
            match Worker::new(id, Arc::clone(&pool.shared)) {
                Ok(worker) => pool.workers.push(worker),
                Err(err) => {
                    // Dropping the pool stops whatever was started.
                    drop(pool);
                    return Err(err);
                }
            }
        }
        debug!(size, "thread pool started");

        Ok(pool)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` with the given priority. Larger priorities run first.
    pub fn submit<F>(&self, priority: u64, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.closed {
            bail!("cannot submit work to a thread pool that is shutting down");
        }
        state.enqueue(priority, Box::new(f));
        self.shared.available.notify_one();
        Ok(())
    }

    /// Queues a whole batch under one lock, so no worker can start a job
    /// before every job in the batch is ordered against it.
    ///
    /// Within the batch, equal priorities keep iteration order.
    pub fn submit_all<I, F>(&self, jobs: I) -> Result<usize>
    where
        I: IntoIterator<Item = (u64, F)>,
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.closed {
            bail!("cannot submit work to a thread pool that is shutting down");
        }
        let mut queued = 0;
        for (priority, f) in jobs {
            state.enqueue(priority, Box::new(f));
            queued += 1;
        }
        if queued > 0 {
            self.shared.available.notify_all();
        }
        Ok(queued)
    }

    /// Lets every queued job finish, then joins all workers.
    ///
    /// Returns an error if any worker died because a job panicked. All
    /// workers are joined regardless.
    pub fn shutdown(mut self) -> Result<()> {
        let panicked = self.stop();
        if panicked > 0 {
            bail!("{} of {} pool workers panicked", panicked, self.size());
        }
        debug!("thread pool stopped");
        Ok(())
    }

    /// Queues the sentinel and joins every worker, returning how many of
    /// them panicked. Idempotent.
    fn stop(&mut self) -> usize {
        {
            let mut state = self.shared.lock();
            if !state.closed {
                state.closed = true;
                state.queue.push(Work::Shutdown);
                self.shared.available.notify_one();
            }
        }

        let mut panicked = 0;
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(worker = worker.id, "pool worker panicked");
                    panicked += 1;
                }
            }
        }
        panicked
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, shared: Arc<Shared>) -> Result<Worker> {
        let thread = thread::Builder::new()
            .name(format!("mrpool-worker-{}", id))
            .spawn(move || run_worker(id, &shared))
            .with_context(|| format!("failed to spawn pool worker {}", id))?;

        Ok(Worker {
            id,
            thread: Some(thread),
        })
    }
}

fn run_worker(id: usize, shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.lock();
            while state.queue.is_empty() && !state.terminating {
                state = shared
                    .available
                    .wait(state)
                    .expect("thread pool lock poisoned");
            }
            if state.terminating {
                break;
            }
            match state.queue.pop() {
                Some(Work::Task { run, seq, .. }) => {
                    trace!(worker = id, seq, "job started");
                    run
                }
                Some(Work::Shutdown) => {
                    state.terminating = true;
                    shared.available.notify_all();
                    break;
                }
                None => continue,
            }
        };
        // Run outside the lock so slow jobs never block dequeuing.
        task();
    }
    trace!(worker = id, "worker exiting");
}

/// Converts a joined thread's panic payload into an error message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        anyhow!("{}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        anyhow!("{}", msg)
    } else {
        anyhow!("unknown panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn rejects_zero_workers() {
        assert!(ThreadPool::new(0).is_err());
    }

    #[test]
    fn runs_every_job() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(i, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn larger_job_runs_first() {
        let pool = ThreadPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = mpsc::channel::<()>();

        // Hold the only worker until both jobs are queued.
        pool.submit(u64::MAX, move || {
            gate.recv().unwrap();
        })
        .unwrap();
        for size in [10u64, 100] {
            let order = Arc::clone(&order);
            pool.submit(size, move || order.lock().unwrap().push(size))
                .unwrap();
        }
        release.send(()).unwrap();
        pool.shutdown().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![100, 10]);
    }

    #[test]
    fn batch_is_ordered_before_any_job_starts() {
        for _ in 0..200 {
            let pool = ThreadPool::new(1).unwrap();
            let order = Arc::new(Mutex::new(Vec::new()));
            let jobs = [10u64, 100, 50, 100].into_iter().enumerate().map(|(i, size)| {
                let order = Arc::clone(&order);
                (size, move || order.lock().unwrap().push((size, i)))
            });
            assert_eq!(pool.submit_all(jobs).unwrap(), 4);
            pool.shutdown().unwrap();

            assert_eq!(
                *order.lock().unwrap(),
                vec![(100, 1), (100, 3), (50, 2), (10, 0)]
            );
        }
    }

    #[test]
    fn empty_batch_and_closed_pool() {
        let mut pool = ThreadPool::new(2).unwrap();
        let none = std::iter::empty::<(u64, fn())>();
        assert_eq!(pool.submit_all(none).unwrap(), 0);
        pool.stop();
        assert!(pool.submit_all([(1, || {})]).is_err());
    }

    #[test]
    fn shutdown_joins_idle_workers() {
        let pool = ThreadPool::new(8).unwrap();
        assert_eq!(pool.size(), 8);
        pool.submit(1, || {}).unwrap();
        pool.shutdown().unwrap();
    }

    #[test]
    fn shutdown_without_work() {
        let pool = ThreadPool::new(3).unwrap();
        pool.shutdown().unwrap();
    }

    #[test]
    fn drop_stops_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2).unwrap();
            let counter = Arc::clone(&counter);
            pool.submit(0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_close_is_rejected() {
        let mut pool = ThreadPool::new(1).unwrap();
        assert_eq!(pool.stop(), 0);
        assert!(pool.submit(0, || {}).is_err());
    }

    #[test]
    fn panicking_job_is_reported_and_others_finish() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(100, || panic!("boom")).unwrap();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(1, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let err = pool.shutdown().unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = thread::spawn(|| panic!("reducer failed"))
            .join()
            .map_err(panic_message)
            .unwrap_err();
        assert_eq!(err.to_string(), "reducer failed");
    }
}
