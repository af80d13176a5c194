//! Fixed set of case workers, each with its own job queue.
//!
//! The pool lives inside a `std::thread::scope`, so jobs may borrow the engine's case
//! matrix, work-area arena and selection rows directly. Reports come back on one shared
//! completion channel.

use crate::case::CaseReport;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::Duration;
use thiserror::Error;
use thread_local::ThreadLocal;

pub type Job<'env> = Box<dyn FnOnce(usize) -> CaseReport + Send + 'env>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to start worker thread {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: io::Error,
    },

    #[error("Worker {worker} panicked while processing a case.")]
    Panicked { worker: usize },

    #[error("Worker {worker} is no longer accepting jobs.")]
    Disconnected { worker: usize },
}

enum Completion {
    Done(CaseReport),
    Panicked(usize),
}

/// Task timing of the cases one worker thread ran.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaskStats {
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for TaskStats {
    fn default() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }
}

impl TaskStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    pub fn merge(&mut self, other: &TaskStats) {
        self.count += other.count;
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.total / n,
        }
    }
}

/// Per-thread task statistics, written without locks by whichever worker ran the case.
#[derive(Default)]
pub struct PerfMonitor {
    per_thread: ThreadLocal<RefCell<TaskStats>>,
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        self.per_thread
            .get_or(|| RefCell::new(TaskStats::default()))
            .borrow_mut()
            .record(elapsed);
    }

    /// Number of threads that recorded at least one task, and their combined statistics.
    pub fn summary(&mut self) -> (usize, TaskStats) {
        let mut total = TaskStats::default();
        let mut threads = 0;
        for stats in self.per_thread.iter_mut() {
            total.merge(stats.get_mut());
            threads += 1;
        }
        (threads, total)
    }
}

pub struct WorkerPool<'scope, 'env> {
    queues: Vec<Sender<Job<'env>>>,
    completions: Receiver<Completion>,
    handles: Vec<ScopedJoinHandle<'scope, ()>>,
}

impl<'scope, 'env> WorkerPool<'scope, 'env> {
    pub fn spawn(scope: &'scope Scope<'scope, 'env>, n_workers: usize) -> Result<Self, PoolError> {
        let (done, completions) = unbounded();
        let mut queues = Vec::with_capacity(n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for worker in 0..n_workers {
            let (tx, rx) = unbounded::<Job<'env>>();
            let done: Sender<Completion> = done.clone();
            let handle = thread::Builder::new()
                .name(format!("lfs-worker-{worker}"))
                .spawn_scoped(scope, move || {
                    for job in rx {
                        let completion =
                            match panic::catch_unwind(AssertUnwindSafe(|| job(worker))) {
                                Ok(report) => Completion::Done(report),
                                Err(_) => Completion::Panicked(worker),
                            };
                        if done.send(completion).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|source| PoolError::Spawn { worker, source })?;
            queues.push(tx);
            handles.push(handle);
        }
        log::debug!("Started {n_workers} case worker(s).");
        Ok(Self {
            queues,
            completions,
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queues `job` on worker `worker`. The job receives the id of the worker running it.
    pub fn submit(&self, worker: usize, job: Job<'env>) -> Result<(), PoolError> {
        let queue = self
            .queues
            .get(worker)
            .ok_or(PoolError::Disconnected { worker })?;
        queue
            .send(job)
            .map_err(|_| PoolError::Disconnected { worker })
    }

    /// Blocks until `n` jobs have completed, handing each report to `on_report`.
    pub fn wait(&self, n: usize, mut on_report: impl FnMut(CaseReport)) -> Result<(), PoolError> {
        for _ in 0..n {
            match self.completions.recv() {
                Ok(Completion::Done(report)) => on_report(report),
                Ok(Completion::Panicked(worker)) => return Err(PoolError::Panicked { worker }),
                Err(_) => return Err(PoolError::Disconnected { worker: 0 }),
            }
        }
        Ok(())
    }

    /// Closes every queue and joins the workers.
    pub fn join(self) -> Result<(), PoolError> {
        let Self {
            queues, handles, ..
        } = self;
        drop(queues);
        for (worker, handle) in handles.into_iter().enumerate() {
            handle.join().map_err(|_| PoolError::Panicked { worker })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{CaseOutcome, CaseTimings};
    use std::sync::Mutex;

    fn report(case: usize, worker: usize) -> CaseReport {
        CaseReport {
            case,
            worker,
            work_area: None,
            outcome: CaseOutcome::DegradedFallback { n_selected: 1 },
            elapsed: Duration::from_micros(case as u64 + 1),
            timings: CaseTimings::default(),
        }
    }

    #[test]
    fn jobs_run_on_their_assigned_worker() {
        let seen = Mutex::new(Vec::new());
        let perf = PerfMonitor::new();
        thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 3).unwrap();
            assert_eq!(pool.len(), 3);
            for case in 0..9 {
                let perf = &perf;
                pool.submit(
                    case % 3,
                    Box::new(move |worker: usize| {
                        let r = report(case, worker);
                        perf.record(r.elapsed);
                        r
                    }),
                )
                .unwrap();
            }
            pool.wait(9, |r| seen.lock().unwrap().push((r.case, r.worker)))
                .unwrap();
            pool.join().unwrap();
        });

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen.len(), 9);
        assert!(seen.iter().all(|(case, worker)| case % 3 == *worker));

        let mut perf = perf;
        let (threads, stats) = perf.summary();
        assert_eq!(threads, 3);
        assert_eq!(stats.count, 9);
        assert_eq!(stats.min, Duration::from_micros(1));
        assert_eq!(stats.max, Duration::from_micros(9));
        assert_eq!(stats.mean(), Duration::from_micros(5));
    }

    #[test]
    fn panicking_job_is_reported() {
        thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 1).unwrap();
            pool.submit(0, Box::new(|_: usize| -> CaseReport { panic!("boom") }))
                .unwrap();
            assert!(matches!(
                pool.wait(1, |_| {}),
                Err(PoolError::Panicked { worker: 0 })
            ));
            pool.join().unwrap();
        });
    }

    #[test]
    fn unknown_worker_is_rejected() {
        thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 2).unwrap();
            assert!(matches!(
                pool.submit(5, Box::new(|w: usize| report(0, w))),
                Err(PoolError::Disconnected { worker: 5 })
            ));
        });
    }
}
