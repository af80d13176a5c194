// ========================================================================================
//
//                         The Iteration Orchestrator
//
// ========================================================================================
//
// The engine owns every buffer of a run: the standardized case matrix, the class ids,
// the current and previous selection matrices, and the arena of work areas. A run is a
// fixed number of passes over all cases. Each pass snapshots the previous pass's
// selections (they drive the weights), queues every case on a scoped worker pool, and
// waits for all of them before the next pass. The arena bounds how many cases are in
// flight at once.

use crate::case::{
    CaseContext, CaseError, CaseOutcome, CaseTimings, WeightSource, process_case,
    selection_constraints,
};
use crate::device::{DeviceWorker, create_kernel};
use crate::pool::{PerfMonitor, PoolError, TaskStats, WorkerPool};
use crate::progress::{IterationStats, NoopObserver, RunLabel, RunObserver};
use crate::simplex::SolveCounters;
use crate::types::{SolverKind, WeightBackend};
use crate::work_area::{Arena, ArenaStats, WorkArea, WorkAreaArena};
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis};
use rayon::prelude::*;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Work areas per requested thread.
const AREAS_PER_THREAD: usize = 4;

/// Smallest standard deviation a variable may have and still be standardized.
const MIN_STD: f64 = 1e-15;

#[derive(Error, Debug)]
pub enum LfsError {
    #[error("At least two cases are required, found {0}.")]
    TooFewCases(usize),

    #[error("The data matrix has no variable columns besides the class column.")]
    NoVariables,

    #[error("'{name}' must be at least 1, got {value}.")]
    InvalidParameter { name: &'static str, value: usize },

    #[error("Row {row} has class value {value}, which is not a non-negative integer.")]
    InvalidClass { row: usize, value: f64 },

    #[error("Row {row}, variable {var} is not finite.")]
    NonFinite { row: usize, var: usize },

    #[error("Variable {var} has zero variance (standard deviation {std:e}).")]
    ZeroVariance { var: usize, std: f64 },

    #[error("Worker pool failure: {0}")]
    Pool(#[from] PoolError),

    #[error("Invariant violated while processing row {row}: {source}")]
    FatalCase {
        row: usize,
        #[source]
        source: CaseError,
    },
}

/// Construction-time settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub max_kept: usize,
    pub max_threads: usize,
    pub verbose: bool,
    pub solver: SolverKind,
    pub weights: WeightBackend,
    pub deterministic: bool,
}

impl EngineOptions {
    pub fn new(max_kept: usize, max_threads: usize, verbose: bool) -> Self {
        Self {
            max_kept,
            max_threads,
            verbose,
            solver: SolverKind::default(),
            weights: WeightBackend::default(),
            deterministic: false,
        }
    }
}

/// What a call to [`Lfs::run`] did.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub iterations: Vec<IterationStats>,
    pub elapsed: Duration,
    /// Case timings summed over every case of every iteration.
    pub timings: CaseTimings,
    /// Name of the weight kernel behind the device queue, if one was used.
    pub device_kernel: Option<&'static str>,
    pub worker_threads: usize,
    pub tasks: TaskStats,
    pub solver: SolveCounters,
    pub arena: ArenaStats,
    /// Fraction of cases that selected each variable in the final pass.
    pub selection_frequency: Vec<f64>,
}

impl RunSummary {
    pub fn final_iteration(&self) -> Option<&IterationStats> {
        self.iterations.last()
    }

    pub fn log(&self) {
        log::info!(
            "Run finished in {:.3}s on {} worker thread(s).",
            self.elapsed.as_secs_f64(),
            self.worker_threads
        );
        if let Some(last) = self.final_iteration() {
            log::info!(
                "Final pass: {} optimal, {} fallback, {} failed.",
                last.optimal,
                last.fallback,
                last.failed
            );
        }
        log::info!(
            "Time in weights {:.3}s, LP {:.3}s, binarization {:.3}s, criterion {:.3}s.",
            self.timings.weights.as_secs_f64(),
            self.timings.lp.as_secs_f64(),
            self.timings.binarize.as_secs_f64(),
            self.timings.criterion.as_secs_f64()
        );
        if let Some(kernel) = self.device_kernel {
            let d = &self.timings.device;
            log::info!(
                "Device '{kernel}': diff {:?}, dist {:?}, mindist {:?}, term {:?}, transpose {:?}, sum {:?}, readback {:?}.",
                d.diff,
                d.dist,
                d.mindist,
                d.term,
                d.transpose,
                d.sum,
                d.readback
            );
        }
        log::info!(
            "Case tasks: {} run, mean {:?}, min {:?}, max {:?}.",
            self.tasks.count,
            self.tasks.mean(),
            if self.tasks.count == 0 {
                Duration::ZERO
            } else {
                self.tasks.min
            },
            self.tasks.max
        );
        if self.solver.check_counters() {
            log::debug!("Solver exits off the clean path: {:?}", self.solver);
        }
    }
}

pub struct Lfs {
    /// Standardized cases, grouped by class.
    cases: Array2<f64>,
    /// Class id of every grouped case.
    classes: Vec<usize>,
    /// Input row of every grouped case.
    input_rows: Vec<usize>,
    class_labels: Vec<u64>,
    f_binary: Array2<u8>,
    f_prior: Array2<u8>,
    /// `f_binary` in input row order.
    f_output: Array2<u8>,
    arena: WorkAreaArena,
    options: EngineOptions,
    n_threads: usize,
}

/// Maps class values to ids `0..` in ascending value order.
fn map_classes(column: impl Iterator<Item = f64>) -> Result<(Vec<usize>, Vec<u64>), LfsError> {
    let mut raw = Vec::new();
    for (row, value) in column.enumerate() {
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
            return Err(LfsError::InvalidClass { row, value });
        }
        raw.push(value as u64);
    }
    let mut labels = raw.clone();
    labels.sort_unstable();
    labels.dedup();
    let ids = raw
        .iter()
        .map(|v| labels.partition_point(|l| l < v))
        .collect();
    Ok((ids, labels))
}

/// Standardizes every column in place to population mean 0 and standard deviation 1.
fn standardize(cases: &mut Array2<f64>) -> Result<(), LfsError> {
    let n = cases.nrows() as f64;
    cases
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .try_for_each(|(var, mut col)| {
            let mean = col.sum() / n;
            let var_sum: f64 = col.iter().map(|x| (x - mean) * (x - mean)).sum();
            let std = (var_sum / n).sqrt();
            if std.is_nan() || std < MIN_STD {
                return Err(LfsError::ZeroVariance { var, std });
            }
            col.mapv_inplace(|x| (x - mean) / std);
            Ok(())
        })
}

impl Lfs {
    /// Builds an engine from `data`, whose last column holds the class of each row.
    pub fn new(
        data: ArrayView2<'_, f64>,
        max_kept: usize,
        max_threads: usize,
        verbose: bool,
    ) -> Result<Self, LfsError> {
        Self::with_options(data, EngineOptions::new(max_kept, max_threads, verbose))
    }

    pub fn with_options(data: ArrayView2<'_, f64>, options: EngineOptions) -> Result<Self, LfsError> {
        let n_cases = data.nrows();
        if n_cases < 2 {
            return Err(LfsError::TooFewCases(n_cases));
        }
        if data.ncols() < 2 {
            return Err(LfsError::NoVariables);
        }
        let n_vars = data.ncols() - 1;
        if options.max_kept == 0 {
            return Err(LfsError::InvalidParameter {
                name: "max_kept",
                value: options.max_kept,
            });
        }
        if options.max_threads == 0 {
            return Err(LfsError::InvalidParameter {
                name: "max_threads",
                value: options.max_threads,
            });
        }

        // --- Classes, then a stable regroup so each class is contiguous ---
        let (raw_classes, class_labels) = map_classes(data.column(n_vars).iter().copied())?;
        let mut input_rows: Vec<usize> = (0..n_cases).collect();
        input_rows.sort_by_key(|row| raw_classes[*row]);
        let classes: Vec<usize> = input_rows.iter().map(|row| raw_classes[*row]).collect();

        let mut cases = Array2::zeros((n_cases, n_vars));
        for (mut dst, src) in cases.rows_mut().into_iter().zip(&input_rows) {
            for (var, (d, s)) in dst.iter_mut().zip(data.row(*src)).enumerate() {
                if !s.is_finite() {
                    return Err(LfsError::NonFinite { row: *src, var });
                }
                *d = *s;
            }
        }
        standardize(&mut cases)?;

        // --- Threads and work areas ---
        let n_threads = options.max_threads.min(num_cpus::get()).max(1);
        let n_areas = n_cases.min(AREAS_PER_THREAD * options.max_threads);
        let shared = selection_constraints(n_vars, options.max_kept);
        let arena = Arena::new(
            (0..n_areas)
                .map(|_| WorkArea::new(n_cases, n_vars, shared.view(), options.solver))
                .collect(),
        );

        log::info!(
            "LFS engine: {n_cases} cases, {n_vars} variables, {} classes, max_kept {}, {n_threads} thread(s), {n_areas} work areas, {} solver.",
            class_labels.len(),
            options.max_kept,
            options.solver
        );

        Ok(Self {
            cases,
            classes,
            input_rows,
            class_labels,
            f_binary: Array2::zeros((n_cases, n_vars)),
            f_prior: Array2::zeros((n_cases, n_vars)),
            f_output: Array2::zeros((n_cases, n_vars)),
            arena,
            options,
            n_threads,
        })
    }

    pub fn n_cases(&self) -> usize {
        self.cases.nrows()
    }

    pub fn n_vars(&self) -> usize {
        self.cases.ncols()
    }

    /// Distinct class values in ascending order; class id `c` stands for `class_labels()[c]`.
    pub fn class_labels(&self) -> &[u64] {
        &self.class_labels
    }

    /// Class id of every input row.
    pub fn classes(&self) -> Vec<usize> {
        let mut out = vec![0; self.n_cases()];
        for (class, row) in self.classes.iter().zip(&self.input_rows) {
            out[*row] = *class;
        }
        out
    }

    pub fn work_areas(&self) -> usize {
        self.arena.len()
    }

    pub fn worker_threads(&self) -> usize {
        if self.options.deterministic {
            1
        } else {
            self.n_threads
        }
    }

    /// One worker thread and CPU weights from the next run on.
    pub fn set_deterministic_mode(&mut self, deterministic: bool) {
        self.options.deterministic = deterministic;
    }

    /// Selections of the last run, one row per input row.
    pub fn get_f(&self) -> ArrayView2<'_, u8> {
        self.f_output.view()
    }

    pub fn run(
        &mut self,
        iters: usize,
        n_rand: usize,
        n_beta: usize,
        rep: usize,
        reps: usize,
    ) -> Result<RunSummary, LfsError> {
        self.run_observed(iters, n_rand, n_beta, rep, reps, &NoopObserver)
    }

    /// [`Lfs::run`] with progress events sent to `observer`.
    pub fn run_observed(
        &mut self,
        iters: usize,
        n_rand: usize,
        n_beta: usize,
        rep: usize,
        reps: usize,
        observer: &dyn RunObserver,
    ) -> Result<RunSummary, LfsError> {
        for (name, value) in [("iters", iters), ("n_rand", n_rand), ("n_beta", n_beta)] {
            if value == 0 {
                return Err(LfsError::InvalidParameter { name, value });
            }
        }

        let start = Instant::now();
        let n_cases = self.n_cases();
        let threads = self.worker_threads();
        self.f_binary.fill(0);
        self.f_prior.fill(0);

        let mut device = self.start_device(iters);
        let device_kernel = device.as_ref().map(DeviceWorker::kernel_name);
        let mut perf = PerfMonitor::new();
        let mut timings = CaseTimings::default();
        let mut history = Vec::with_capacity(iters);

        for iteration in 0..iters {
            let label = RunLabel {
                rep,
                reps,
                iteration,
                iterations: iters,
            };
            log::info!("Starting {label}.");
            observer.iteration_started(&label, n_cases);
            let iter_start = Instant::now();

            // --- Snapshot the previous pass; it is the metric for this pass's weights ---
            if iteration > 0 {
                self.f_prior.assign(&self.f_binary);
                let loaded = match &device {
                    Some(worker) => worker.load_flags(self.f_prior.view()),
                    None => Ok(()),
                };
                if let Err(e) = loaded {
                    log::warn!("Device weights unavailable ({e}); continuing with CPU weights.");
                    device = None;
                }
            }
            let device_handle = device.as_ref().map(DeviceWorker::handle);
            let weights = match (iteration, &device_handle) {
                (0, _) => WeightSource::Uniform,
                (_, Some(handle)) => WeightSource::Device(handle),
                (_, None) => WeightSource::Cpu,
            };

            let ctx = CaseContext {
                cases: self.cases.view(),
                classes: &self.classes,
                f_prior: self.f_prior.view(),
                max_kept: self.options.max_kept,
                n_rand,
                n_beta,
                workers: threads,
                weights,
            };
            let ctx = &ctx;
            let arena = &self.arena;
            let input_rows = &self.input_rows;
            let verbose = self.options.verbose;
            let perf_ref = &perf;
            let mut rows: Vec<Option<ArrayViewMut1<'_, u8>>> =
                self.f_binary.rows_mut().into_iter().map(Some).collect();
            let mut stats = IterationStats::default();
            let mut fatal: Option<(usize, CaseError)> = None;

            // Every case is queued at once; a case that finds all work areas leased waits
            // inside `process_case` until one is released.
            thread::scope(|s| -> Result<(), LfsError> {
                let pool = WorkerPool::spawn(s, threads)?;
                for (case, slot) in rows.iter_mut().enumerate() {
                    let Some(row) = slot.take() else {
                        continue;
                    };
                    pool.submit(
                        case % threads,
                        Box::new(move |worker: usize| {
                            let report = process_case(ctx, arena, case, worker, row);
                            perf_ref.record(report.elapsed);
                            report
                        }),
                    )?;
                }
                pool.wait(n_cases, |report| {
                    observer.case_finished(&report);
                    stats.record(&report.outcome);
                    timings.accumulate(&report.timings);
                    let row = input_rows[report.case];
                    match report.outcome {
                        CaseOutcome::Failed(e) if e.is_fatal() => {
                            log::error!("Row {row}: {e}");
                            if fatal.is_none() {
                                fatal = Some((row, e));
                            }
                        }
                        CaseOutcome::Failed(e) => log::warn!("Row {row} failed: {e}"),
                        outcome if verbose => log::info!("Row {row}: {outcome:?}"),
                        outcome => log::debug!("Row {row}: {outcome:?}"),
                    }
                })?;
                pool.join()?;
                Ok(())
            })?;

            stats.elapsed = iter_start.elapsed();
            log::info!(
                "Finished {label} in {:.3}s: {} optimal, {} fallback, {} failed.",
                stats.elapsed.as_secs_f64(),
                stats.optimal,
                stats.fallback,
                stats.failed
            );
            observer.iteration_finished(&label, &stats);
            history.push(stats);

            if let Some((row, source)) = fatal {
                return Err(LfsError::FatalCase { row, source });
            }
        }

        if let Some(worker) = device {
            match worker.shutdown() {
                Ok((kernel, totals)) => log::debug!(
                    "Device kernel '{}' spent {:?} in its stages.",
                    kernel.name(),
                    totals.total()
                ),
                Err(e) => log::warn!("Device worker did not shut down cleanly: {e}"),
            }
        }

        // --- Results back in input order ---
        for (grouped, row) in self.input_rows.iter().enumerate() {
            self.f_output.row_mut(*row).assign(&self.f_binary.row(grouped));
        }
        let selection_frequency = self
            .f_output
            .axis_iter(Axis(1))
            .map(|col| col.iter().filter(|f| **f != 0).count() as f64 / n_cases as f64)
            .collect();

        let mut solver = SolveCounters::default();
        for area in self.arena.slots_mut() {
            solver.merge(&area.solver_totals);
            area.solver_totals = SolveCounters::default();
        }
        let (worker_threads, tasks) = perf.summary();
        observer.run_finished();

        let summary = RunSummary {
            iterations: history,
            elapsed: start.elapsed(),
            timings,
            device_kernel,
            worker_threads,
            tasks,
            solver,
            arena: self.arena.stats(),
            selection_frequency,
        };
        summary.log();
        Ok(summary)
    }

    fn start_device(&self, iters: usize) -> Option<DeviceWorker> {
        let backend = self.options.weights;
        if backend == WeightBackend::Cpu || self.options.deterministic || iters < 2 {
            return None;
        }
        let started = create_kernel(backend)
            .and_then(|kernel| DeviceWorker::spawn(kernel, self.cases.view(), &self.classes));
        match started {
            Ok(worker) => {
                log::info!("Weights from iteration 2 on use the '{}' kernel.", worker.kernel_name());
                Some(worker)
            }
            Err(e) => {
                log::warn!("The {backend} weight back end is unavailable ({e}); using CPU weights.");
                None
            }
        }
    }
}
