//! Optimization of a single case.
//!
//! For target case `i` the optimizer:
//!
//! 1. fills `delta[j] = x[i] - x[j]` and the case weights,
//! 2. builds `a[v] = -Σ w[j]·delta[j][v]²` over same-class `j ≠ i` and
//!    `b[v] = Σ w[j]·delta[j][v]²` over other-class `j`,
//! 3. maximizes `b·f` under the selection rows to get `eps_max`,
//! 4. for each β maximizes `a·f` with the extra row `b·f ≥ β·eps_max + 1e-9`,
//! 5. binarizes every fractional optimum by Monte-Carlo sampling, scores the binary
//!    candidate with a rank criterion and keeps the best one,
//! 6. falls back to the variables with the most negative `a` when no β yields a candidate.

use crate::device::DeviceHandle;
use crate::rng::ParkMiller;
use crate::simplex::{LpError, LpProblem, SolveCounters, SolveLimits, verify_solution};
use crate::sort::{assign_tied_ranks, sort_with_slave};
use crate::weights::{KernelTimings, WeightError, compute_weights, uniform_weights};
use crate::work_area::{WorkArea, WorkAreaArena, WorkAreaError};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, s};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Criterion recorded for a β trial whose LP had no optimum.
pub const FAILED_TRIAL: f64 = -1e60;

/// Added to every β threshold so that `β·eps_max` is never met with equality at zero.
const BETA_MARGIN: f64 = 1e-9;

/// Relative tolerance of the post-solve consistency check.
const CHECK_EPS: f64 = 1e-6;

/// Attempts to lease a work area before the case gives up.
const ACQUIRE_ATTEMPTS: usize = 100_000;

#[derive(Error, Debug)]
pub enum CaseError {
    #[error(transparent)]
    WorkArea(#[from] WorkAreaError),

    #[error("Worker {worker} is outside the pool of {workers} workers.")]
    InvalidWorker { worker: usize, workers: usize },

    #[error("Case {case} is outside the {n_cases} cases.")]
    InvalidCase { case: usize, n_cases: usize },

    #[error("Malformed LP for case: {0}")]
    Problem(LpError),

    #[error("The inter-class LP failed: {0}")]
    InterClass(LpError),

    #[error("The {stage} LP solution failed its consistency check: {source}")]
    SolutionCheck {
        stage: &'static str,
        #[source]
        source: LpError,
    },

    #[error("The {stage} LP reached its optimum through a pathological exit: {counters:?}")]
    PathologicalExit {
        stage: &'static str,
        counters: SolveCounters,
    },

    #[error("Weight computation failed: {0}")]
    Weights(#[from] WeightError),
}

impl CaseError {
    /// Invariant violations that must abort the run once the iteration completes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaseError::WorkArea(WorkAreaError::Collision { .. })
                | CaseError::InvalidWorker { .. }
                | CaseError::InvalidCase { .. }
        )
    }
}

#[derive(Debug)]
pub enum CaseOutcome {
    /// At least one β produced a binary candidate; the best one was committed.
    Optimal {
        n_selected: usize,
        criterion: f64,
        feasible_betas: usize,
    },
    /// No β produced a candidate; the emergency selection was committed.
    DegradedFallback { n_selected: usize },
    /// Nothing was committed; the row keeps its previous value.
    Failed(CaseError),
}

impl CaseOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CaseOutcome::Failed(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CaseTimings {
    pub weights: Duration,
    pub device: KernelTimings,
    pub lp: Duration,
    pub binarize: Duration,
    pub criterion: Duration,
}

impl CaseTimings {
    pub fn accumulate(&mut self, other: &CaseTimings) {
        self.weights += other.weights;
        self.device.accumulate(&other.device);
        self.lp += other.lp;
        self.binarize += other.binarize;
        self.criterion += other.criterion;
    }
}

#[derive(Debug)]
pub struct CaseReport {
    pub case: usize,
    pub worker: usize,
    pub work_area: Option<usize>,
    pub outcome: CaseOutcome,
    pub elapsed: Duration,
    pub timings: CaseTimings,
}

/// Where a case gets its weights from.
#[derive(Clone, Copy)]
pub enum WeightSource<'a> {
    /// Iteration 0: all ones.
    Uniform,
    Cpu,
    Device(&'a DeviceHandle),
}

/// Read-only inputs shared by every case of one iteration.
#[derive(Clone, Copy)]
pub struct CaseContext<'a> {
    pub cases: ArrayView2<'a, f64>,
    pub classes: &'a [usize],
    pub f_prior: ArrayView2<'a, u8>,
    pub max_kept: usize,
    pub n_rand: usize,
    pub n_beta: usize,
    pub workers: usize,
    pub weights: WeightSource<'a>,
}

impl CaseContext<'_> {
    fn n_vars(&self) -> usize {
        self.cases.ncols()
    }
}

/// The `n_vars + 2` rows every case shares: `f_v ≤ 1` per variable, `Σf ≤ max_kept`, then
/// `Σf ≥ 1`. Rows are `[rhs, coef_1..coef_n]`.
pub fn selection_constraints(n_vars: usize, max_kept: usize) -> Array2<f64> {
    let mut rows = Array2::zeros((n_vars + 2, n_vars + 1));
    for v in 0..n_vars {
        rows[[v, 0]] = 1.0;
        rows[[v, v + 1]] = 1.0;
    }
    rows[[n_vars, 0]] = max_kept as f64;
    rows[[n_vars + 1, 0]] = 1.0;
    rows.slice_mut(s![n_vars.., 1..]).fill(1.0);
    rows
}

/// Number of variables the emergency fallback selects.
pub fn emergency_count(n_vars: usize, max_kept: usize) -> usize {
    (n_vars / 10).clamp(1, 5).min(max_kept)
}

/// Optimizes case `case` and commits the winner into `row`.
///
/// The report is produced after the work area has been released.
pub fn process_case(
    ctx: &CaseContext<'_>,
    arena: &WorkAreaArena,
    case: usize,
    worker: usize,
    mut row: ArrayViewMut1<'_, u8>,
) -> CaseReport {
    let start = Instant::now();
    let mut timings = CaseTimings::default();
    let mut work_area = None;

    let outcome = match lease_and_optimize(ctx, arena, case, worker, &mut row, &mut timings) {
        Ok((id, outcome)) => {
            work_area = Some(id);
            outcome
        }
        Err(e) => CaseOutcome::Failed(e),
    };

    CaseReport {
        case,
        worker,
        work_area,
        outcome,
        elapsed: start.elapsed(),
        timings,
    }
}

fn lease_and_optimize(
    ctx: &CaseContext<'_>,
    arena: &WorkAreaArena,
    case: usize,
    worker: usize,
    row: &mut ArrayViewMut1<'_, u8>,
    timings: &mut CaseTimings,
) -> Result<(usize, CaseOutcome), CaseError> {
    if worker >= ctx.workers {
        return Err(CaseError::InvalidWorker {
            worker,
            workers: ctx.workers,
        });
    }
    let n_cases = ctx.classes.len();
    if case >= n_cases {
        return Err(CaseError::InvalidCase { case, n_cases });
    }

    let mut lease = arena.acquire_with_retry(ACQUIRE_ATTEMPTS)?;
    let id = lease.id();
    let area: &mut WorkArea = &mut lease;
    let outcome = optimize(ctx, area, case, timings)?;
    row.assign(&ArrayView1::from(&area.best_overall));
    Ok((id, outcome))
}

fn optimize(
    ctx: &CaseContext<'_>,
    area: &mut WorkArea,
    case: usize,
    timings: &mut CaseTimings,
) -> Result<CaseOutcome, CaseError> {
    let n_cases = ctx.classes.len();
    let n_vars = ctx.n_vars();
    let target_class = ctx.classes[case];

    let x_target = ctx.cases.row(case);
    for (mut delta_row, x_j) in area.delta.rows_mut().into_iter().zip(ctx.cases.rows()) {
        for ((d, a), b) in delta_row.iter_mut().zip(x_target.iter()).zip(x_j.iter()) {
            *d = a - b;
        }
    }

    let t = Instant::now();
    match ctx.weights {
        WeightSource::Uniform => uniform_weights(&mut area.weights),
        WeightSource::Cpu => compute_weights(
            case,
            ctx.classes,
            area.delta.view(),
            ctx.f_prior,
            &mut area.weight_scratch,
            &mut area.weights,
        )?,
        WeightSource::Device(device) => {
            let stages = device.compute(case, &mut area.weights)?;
            timings.device.accumulate(&stages);
        }
    }
    timings.weights += t.elapsed();

    area.a.fill(0.0);
    area.b.fill(0.0);
    for j in 0..n_cases {
        if j == case {
            continue;
        }
        let w = area.weights[j];
        let same = ctx.classes[j] == target_class;
        for (v, d) in area.delta.row(j).iter().enumerate() {
            let term = w * d * d;
            if same {
                area.a[v] -= term;
            } else {
                area.b[v] += term;
            }
        }
    }

    let limits = SolveLimits::for_vars(n_vars);
    let n_less_eq = n_vars + 1;
    let n_shared = n_vars + 2;

    let t = Instant::now();
    let eps_max = {
        let rows = area.constraints.slice(s![..n_shared, ..]);
        let problem = LpProblem::new(&area.b, rows, n_less_eq).map_err(CaseError::Problem)?;
        area.inter.reset();
        let solved = area.inter.solve(&problem, limits);
        let counters = area.inter.counters();
        area.solver_totals.merge(&counters);
        let solution = solved.map_err(CaseError::InterClass)?;
        if counters.check_counters() {
            return Err(CaseError::PathologicalExit {
                stage: "inter-class",
                counters,
            });
        }
        verify_solution(&problem, &solution, CHECK_EPS).map_err(|source| {
            CaseError::SolutionCheck {
                stage: "inter-class",
                source,
            }
        })?;
        solution.objective_value
    };
    timings.lp += t.elapsed();
    log::debug!("Case {case}: eps_max = {eps_max:.6e}");

    let mut best_criterion = FAILED_TRIAL;
    let mut feasible_betas = 0;
    let mut found = false;

    for k in 1..=ctx.n_beta {
        let beta = k as f64 / (ctx.n_beta + 1) as f64;
        {
            let mut threshold = area.constraints.row_mut(n_shared);
            threshold[0] = beta * eps_max + BETA_MARGIN;
            threshold
                .slice_mut(s![1..])
                .assign(&ArrayView1::from(&area.b));
        }

        let t = Instant::now();
        let problem = LpProblem::new(&area.a, area.constraints.view(), n_less_eq)
            .map_err(CaseError::Problem)?;
        area.intra.reset();
        let solved = area.intra.solve(&problem, limits);
        area.solver_totals.merge(&area.intra.counters());
        timings.lp += t.elapsed();
        let f_real = match solved {
            Ok(solution) => {
                verify_solution(&problem, &solution, CHECK_EPS).map_err(|source| {
                    CaseError::SolutionCheck {
                        stage: "intra-class",
                        source,
                    }
                })?;
                solution.values
            }
            Err(e) => {
                log::trace!("Case {case}, beta {beta:.3}: trial skipped ({e})");
                continue;
            }
        };
        feasible_betas += 1;

        let t = Instant::now();
        let accepted = binarize_trial(
            case,
            &f_real,
            &area.a,
            ctx.max_kept,
            ctx.n_rand,
            &mut area.sample,
            &mut area.best_sample,
        );
        timings.binarize += t.elapsed();
        if !accepted {
            continue;
        }

        let t = Instant::now();
        let crit = criterion(
            case,
            ctx.classes,
            area.delta.view(),
            &area.best_sample,
            &area.weights,
            &mut area.distances,
            &mut area.order,
            &mut area.sort_scratch,
        );
        timings.criterion += t.elapsed();
        if !found || crit > best_criterion {
            best_criterion = crit;
            area.best_overall.copy_from_slice(&area.best_sample);
            found = true;
        }
    }
    log::debug!(
        "Case {case}: {feasible_betas} of {} beta trials feasible",
        ctx.n_beta
    );

    if found {
        let n_selected = area.best_overall.iter().filter(|f| **f != 0).count();
        return Ok(CaseOutcome::Optimal {
            n_selected,
            criterion: best_criterion,
            feasible_betas,
        });
    }

    let n_selected = emergency_selection(&area.a, ctx.max_kept, &mut area.best_overall);
    log::warn!(
        "Case {case}: no beta trial produced a candidate; falling back to {n_selected} variable(s)."
    );
    Ok(CaseOutcome::DegradedFallback { n_selected })
}

/// Binarizes one β trial of `case`. The case's generator restarts from its seed on every
/// trial, so the candidate depends only on this trial's optimum.
pub fn binarize_trial(
    case: usize,
    f_real: &[f64],
    a: &[f64],
    max_kept: usize,
    n_rand: usize,
    sample: &mut [u8],
    best: &mut [u8],
) -> bool {
    let mut rng = ParkMiller::for_case(case);
    binarize(f_real, a, max_kept, n_rand, &mut rng, sample, best)
}

/// Monte-Carlo rounding of the fractional optimum `f_real`.
///
/// Draws until `n_rand` samples with between 1 and `max_kept` selections have been accepted
/// and keeps the one maximizing `Σ a[v]·f[v]` in `best`. Rejected draws are not counted
/// towards `n_rand`, but the total number of draws is capped. Returns whether any sample was
/// accepted.
pub fn binarize(
    f_real: &[f64],
    a: &[f64],
    max_kept: usize,
    n_rand: usize,
    rng: &mut ParkMiller,
    sample: &mut [u8],
    best: &mut [u8],
) -> bool {
    let max_draws = n_rand.saturating_mul(100).max(10_000);
    let mut accepted = 0;
    let mut draws = 0;
    let mut best_score = f64::NEG_INFINITY;
    let mut found = false;

    while accepted < n_rand && draws < max_draws {
        draws += 1;
        let mut n = 0;
        for (s, f) in sample.iter_mut().zip(f_real) {
            *s = if rng.next_uniform() < *f {
                n += 1;
                1
            } else {
                0
            };
        }
        if n == 0 || n > max_kept {
            continue;
        }
        accepted += 1;

        let score: f64 = sample
            .iter()
            .zip(a)
            .filter(|(s, _)| **s != 0)
            .map(|(_, a)| *a)
            .sum();
        if !found || score > best_score {
            best_score = score;
            best.copy_from_slice(sample);
            found = true;
        }
    }
    found
}

/// Rank-based separation score of the binary selection `selected` for `target`.
///
/// Squared distances from the target restricted to the selected variables are ranked
/// (ties share their mean rank); other-class cases add `rank·w`, same-class cases
/// subtract it, and the target itself is skipped.
#[allow(clippy::too_many_arguments)]
pub fn criterion(
    target: usize,
    classes: &[usize],
    delta: ArrayView2<'_, f64>,
    selected: &[u8],
    weights: &[f64],
    distances: &mut [f64],
    order: &mut [usize],
    scratch: &mut Vec<(f64, usize)>,
) -> f64 {
    for (j, (d, o)) in distances.iter_mut().zip(order.iter_mut()).enumerate() {
        let mut sum = 0.0;
        for (x, flag) in delta.row(j).iter().zip(selected) {
            if *flag != 0 {
                sum += x * x;
            }
        }
        *d = sum;
        *o = j;
    }
    sort_with_slave(distances, order, scratch);
    assign_tied_ranks(distances);

    let target_class = classes[target];
    let mut crit = 0.0;
    for (rank, k) in distances.iter().zip(order.iter()) {
        if *k == target {
            continue;
        }
        if classes[*k] == target_class {
            crit -= rank * weights[*k];
        } else {
            crit += rank * weights[*k];
        }
    }
    crit
}

/// Writes the emergency selection into `out` and returns how many variables it holds.
pub fn emergency_selection(a: &[f64], max_kept: usize, out: &mut [u8]) -> usize {
    let n = emergency_count(a.len(), max_kept);
    let mut by_a: Vec<usize> = (0..a.len()).collect();
    by_a.sort_by(|x, y| a[*x].total_cmp(&a[*y]));
    out.fill(0);
    for v in by_a.into_iter().take(n) {
        out[v] = 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplex::{LpSolution, LpSolver};
    use crate::types::SolverKind;
    use crate::work_area::Arena;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn arena_for(n_cases: usize, n_vars: usize, max_kept: usize, k: usize) -> WorkAreaArena {
        let shared = selection_constraints(n_vars, max_kept);
        Arena::new(
            (0..k)
                .map(|_| WorkArea::new(n_cases, n_vars, shared.view(), SolverKind::Tableau))
                .collect(),
        )
    }

    fn context<'a>(
        cases: &'a Array2<f64>,
        classes: &'a [usize],
        prior: &'a Array2<u8>,
        max_kept: usize,
    ) -> CaseContext<'a> {
        CaseContext {
            cases: cases.view(),
            classes,
            f_prior: prior.view(),
            max_kept,
            n_rand: 200,
            n_beta: 10,
            workers: 1,
            weights: WeightSource::Uniform,
        }
    }

    #[test]
    fn shared_rows_have_the_documented_layout() {
        let rows = selection_constraints(3, 2);
        assert_eq!(rows.dim(), (5, 4));
        assert_eq!(rows.row(0).to_vec(), vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(rows.row(2).to_vec(), vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(rows.row(3).to_vec(), vec![2.0, 1.0, 1.0, 1.0]);
        assert_eq!(rows.row(4).to_vec(), vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn emergency_count_is_bounded() {
        assert_eq!(emergency_count(4, 3), 1);
        assert_eq!(emergency_count(30, 10), 3);
        assert_eq!(emergency_count(200, 10), 5);
        assert_eq!(emergency_count(200, 2), 2);
    }

    #[test]
    fn binarize_rejects_empty_and_oversized_samples() {
        let a = [-1.0, -2.0, -3.0];
        let mut sample = [0u8; 3];
        let mut best = [0u8; 3];

        let mut rng = ParkMiller::for_case(0);
        assert!(!binarize(&[0.0; 3], &a, 2, 50, &mut rng, &mut sample, &mut best));

        let mut rng = ParkMiller::for_case(0);
        assert!(!binarize(&[1.0; 3], &a, 2, 50, &mut rng, &mut sample, &mut best));

        let mut rng = ParkMiller::for_case(0);
        assert!(binarize(&[1.0, 1.0, 0.0], &a, 2, 50, &mut rng, &mut sample, &mut best));
        assert_eq!(best, [1, 1, 0]);
    }

    #[test]
    fn each_beta_trial_restarts_the_case_generator() {
        let a = [-1.0, -3.0, -0.5, -2.0, -4.0];
        let f_first = [0.3, 0.6, 0.2, 0.5, 0.4];
        let f_other = [0.9, 0.1, 0.8, 0.2, 0.7];
        let mut sample = [0u8; 5];
        let mut first = [0u8; 5];
        let mut other = [0u8; 5];
        let mut again = [0u8; 5];

        assert!(binarize_trial(7, &f_first, &a, 2, 60, &mut sample, &mut first));
        assert!(binarize_trial(7, &f_other, &a, 2, 60, &mut sample, &mut other));
        assert!(binarize_trial(7, &f_first, &a, 2, 60, &mut sample, &mut again));
        assert_eq!(first, again);

        // A generator carried over from the earlier trials would start elsewhere.
        let mut carried = ParkMiller::for_case(7);
        let mut best = [0u8; 5];
        binarize(&f_first, &a, 2, 60, &mut carried, &mut sample, &mut best);
        let fresh = ParkMiller::for_case(7);
        assert_ne!(carried, fresh);
    }

    #[test]
    fn binarize_keeps_the_highest_scoring_sample() {
        let a = [-5.0, -0.1, -0.2, -4.0];
        let mut sample = [0u8; 4];
        let mut best = [0u8; 4];
        let mut rng = ParkMiller::for_case(3);
        assert!(binarize(&[0.5; 4], &a, 1, 400, &mut rng, &mut sample, &mut best));
        assert_eq!(best, [0, 1, 0, 0]);
    }

    #[test]
    fn criterion_rewards_other_class_distance() {
        let classes = [0, 0, 1];
        let delta = array![[0.0, 0.0], [1.0, 5.0], [3.0, 0.0]];
        let weights = [1.0, 1.0, 1.0];
        let mut distances = vec![0.0; 3];
        let mut order = vec![0; 3];
        let mut scratch = Vec::new();

        // Variable 0: same-class case at rank 2, other-class case at rank 3.
        let crit = criterion(
            0,
            &classes,
            delta.view(),
            &[1, 0],
            &weights,
            &mut distances,
            &mut order,
            &mut scratch,
        );
        assert_abs_diff_eq!(crit, 1.0);

        // Variable 1: the other-class case ties with the target and is ranked first.
        let crit = criterion(
            0,
            &classes,
            delta.view(),
            &[0, 1],
            &weights,
            &mut distances,
            &mut order,
            &mut scratch,
        );
        assert_abs_diff_eq!(crit, 1.5 - 3.0);
    }

    #[test]
    fn separating_variable_is_selected() {
        let cases = array![
            [0.0, 1.0, 3.0, 5.0],
            [0.1, 2.0, 1.0, 7.0],
            [0.2, 3.0, 2.0, 6.0],
            [10.0, 1.0, 2.0, 6.0],
            [10.1, 2.0, 3.0, 5.0],
            [10.2, 3.0, 1.0, 7.0]
        ];
        let classes = [0, 0, 0, 1, 1, 1];
        let prior = Array2::<u8>::zeros((6, 4));
        let ctx = context(&cases, &classes, &prior, 2);
        let arena = arena_for(6, 4, 2, 2);

        for case in 0..6 {
            let mut row = Array1::<u8>::zeros(4);
            let report = process_case(&ctx, &arena, case, 0, row.view_mut());
            assert!(
                matches!(report.outcome, CaseOutcome::Optimal { .. }),
                "case {case}: {:?}",
                report.outcome
            );
            assert_eq!(row[0], 1, "case {case}: {row:?}");
            let kept: usize = row.iter().map(|f| *f as usize).sum();
            assert!((1..=2).contains(&kept));
            assert!(report.work_area.is_some());
        }
        assert_eq!(arena.stats().collisions, 0);
    }

    struct RefusingSolver;

    impl LpSolver for RefusingSolver {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn reset(&mut self) {}

        fn solve(&mut self, _: &LpProblem<'_>, _: SolveLimits) -> Result<LpSolution, LpError> {
            Err(LpError::Infeasible)
        }
    }

    #[test]
    fn all_failed_trials_trigger_the_fallback() {
        let cases = array![[0.0, 0.0], [1.0, 2.0], [5.0, 5.0]];
        let classes = [0, 0, 1];
        let prior = Array2::<u8>::zeros((3, 2));
        let ctx = context(&cases, &classes, &prior, 2);
        let shared = selection_constraints(2, 2);
        let mut area = WorkArea::new(3, 2, shared.view(), SolverKind::Tableau);
        area.intra = Box::new(RefusingSolver);
        let arena = Arena::new(vec![area]);

        let mut row = Array1::<u8>::zeros(2);
        let report = process_case(&ctx, &arena, 0, 0, row.view_mut());
        assert!(matches!(
            report.outcome,
            CaseOutcome::DegradedFallback { n_selected: 1 }
        ));
        // a = [-1, -4]: the larger intra-class spread is the more negative entry.
        assert_eq!(row.to_vec(), vec![0, 1]);
    }

    #[derive(Clone, Copy, Debug)]
    enum Misbehaviour {
        Refuse,
        WrongObjective,
        DriftingCleanup,
    }

    /// The tableau, except for the one way it is told to misbehave.
    struct MisbehavingSolver {
        inner: Box<dyn LpSolver>,
        mode: Misbehaviour,
    }

    impl LpSolver for MisbehavingSolver {
        fn name(&self) -> &'static str {
            "misbehaving"
        }

        fn reset(&mut self) {
            self.inner.reset();
        }

        fn solve(
            &mut self,
            problem: &LpProblem<'_>,
            limits: SolveLimits,
        ) -> Result<LpSolution, LpError> {
            let mut solution = match self.mode {
                Misbehaviour::Refuse => return Err(LpError::Infeasible),
                _ => self.inner.solve(problem, limits)?,
            };
            if let Misbehaviour::WrongObjective = self.mode {
                solution.objective_value += 1.0;
            }
            Ok(solution)
        }

        fn counters(&self) -> SolveCounters {
            let mut counters = self.inner.counters();
            if let Misbehaviour::DriftingCleanup = self.mode {
                counters.p1_cleanup_bad += 1;
            }
            counters
        }
    }

    #[test]
    fn inter_class_failures_fail_only_the_case() {
        let cases = array![
            [0.0, 1.0, 3.0, 5.0],
            [0.1, 2.0, 1.0, 7.0],
            [0.2, 3.0, 2.0, 6.0],
            [10.0, 1.0, 2.0, 6.0],
            [10.1, 2.0, 3.0, 5.0],
            [10.2, 3.0, 1.0, 7.0]
        ];
        let classes = [0, 0, 0, 1, 1, 1];
        let prior = Array2::<u8>::zeros((6, 4));
        let ctx = context(&cases, &classes, &prior, 2);
        let shared = selection_constraints(4, 2);

        for mode in [
            Misbehaviour::Refuse,
            Misbehaviour::WrongObjective,
            Misbehaviour::DriftingCleanup,
        ] {
            let mut area = WorkArea::new(6, 4, shared.view(), SolverKind::Tableau);
            area.inter = Box::new(MisbehavingSolver {
                inner: SolverKind::Tableau.create(),
                mode,
            });
            let arena = Arena::new(vec![area]);

            let mut row = Array1::from(vec![1u8, 0, 1, 0]);
            let report = process_case(&ctx, &arena, 2, 0, row.view_mut());
            match (mode, &report.outcome) {
                (Misbehaviour::Refuse, CaseOutcome::Failed(e @ CaseError::InterClass(_)))
                | (
                    Misbehaviour::WrongObjective,
                    CaseOutcome::Failed(e @ CaseError::SolutionCheck { .. }),
                )
                | (
                    Misbehaviour::DriftingCleanup,
                    CaseOutcome::Failed(e @ CaseError::PathologicalExit { .. }),
                ) => assert!(!e.is_fatal(), "{mode:?}: {e}"),
                (_, other) => panic!("{mode:?}: unexpected outcome {other:?}"),
            }
            assert_eq!(row.to_vec(), vec![1, 0, 1, 0], "{mode:?}");
            // The lease was taken and given back.
            assert_eq!(report.work_area, None);
            assert_eq!(arena.stats().acquisitions, 1);
            assert!(arena.acquire().unwrap().is_some());
        }
    }

    #[test]
    fn bad_worker_is_fatal_and_leaves_the_row_alone() {
        let cases = array![[0.0], [1.0]];
        let classes = [0, 1];
        let prior = Array2::<u8>::zeros((2, 1));
        let ctx = context(&cases, &classes, &prior, 1);
        let arena = arena_for(2, 1, 1, 1);

        let mut row = Array1::from(vec![1u8]);
        let report = process_case(&ctx, &arena, 0, 7, row.view_mut());
        match report.outcome {
            CaseOutcome::Failed(e) => assert!(e.is_fatal()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(row[0], 1);
        assert_eq!(report.work_area, None);
    }
}
