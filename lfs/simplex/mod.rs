//! Linear programming for the case optimizer.
//!
//! Every problem has the same shape: maximize `c·x` over `x ≥ 0` subject to dense rows of
//! the form `[rhs, coef_1..coef_n]`. The first `n_less_eq` rows are "≤" constraints and the
//! rest are "≥". Right-hand sides are non-negative. Upper bounds on variables are written
//! as ordinary rows.
//!
//! Two interchangeable back ends sit behind [`LpSolver`]: the dense two-phase tableau in
//! [`tableau`] and a delegate to the `microlp` crate in [`delegate`].

mod delegate;
mod tableau;

pub use delegate::MicrolpSolver;
pub use tableau::TableauSolver;

use crate::types::SolverKind;
use ndarray::{ArrayView1, ArrayView2};
use thiserror::Error;

/// Reduced costs above `-DEFAULT_EPS` count as converged.
pub const DEFAULT_EPS: f64 = 1e-8;

/// Smallest tableau entry accepted as a pivot.
pub const PIVOT_TOLERANCE: f64 = 1e-10;

/// Per-solve limits: an iteration cap applied to each phase and the convergence tolerance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveLimits {
    pub max_iters: usize,
    pub eps: f64,
}

impl SolveLimits {
    pub fn new(max_iters: usize, eps: f64) -> Self {
        Self { max_iters, eps }
    }

    /// `10·n + 1000` iterations per phase for `n` structural variables.
    pub fn for_vars(n_vars: usize) -> Self {
        Self::new(10 * n_vars + 1000, DEFAULT_EPS)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LpError {
    #[error("The objective is unbounded above on the feasible region.")]
    Unbounded,

    #[error("The simplex did not converge within {max_iters} iterations.")]
    IterationLimit { max_iters: usize },

    #[error("The constraints admit no feasible point.")]
    Infeasible,

    #[error("The constraint matrix is rank-deficient: constraint {row} is redundant.")]
    RankDeficient { row: usize },

    #[error("Constraint {row} has a negative right-hand side ({rhs}).")]
    NegativeRhs { row: usize, rhs: f64 },

    #[error("Problem shape mismatch: {0}")]
    Shape(String),

    #[error("The delegated solver failed: {0}")]
    Backend(String),

    #[error("Reported optimum {reported} disagrees with the recomputed objective {recomputed}.")]
    ObjectiveCheck { reported: f64, recomputed: f64 },

    #[error("Constraint {row} is violated: lhs {lhs}, rhs {rhs}.")]
    ConstraintCheck { row: usize, lhs: f64, rhs: f64 },
}

/// The relation between a row's left- and right-hand sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowSense {
    LessEq,
    GreaterEq,
}

/// A borrowed LP instance.
///
/// `rows` has one column more than `objective` has entries: column 0 is the right-hand
/// side. Nothing is copied, so a work area can rebuild one for every solve.
#[derive(Clone, Copy, Debug)]
pub struct LpProblem<'a> {
    objective: &'a [f64],
    rows: ArrayView2<'a, f64>,
    n_less_eq: usize,
}

impl<'a> LpProblem<'a> {
    pub fn new(
        objective: &'a [f64],
        rows: ArrayView2<'a, f64>,
        n_less_eq: usize,
    ) -> Result<Self, LpError> {
        if objective.is_empty() {
            return Err(LpError::Shape("the objective has no variables".to_string()));
        }
        if rows.ncols() != objective.len() + 1 {
            return Err(LpError::Shape(format!(
                "{} variables need {} columns per constraint row, found {}",
                objective.len(),
                objective.len() + 1,
                rows.ncols()
            )));
        }
        if n_less_eq > rows.nrows() {
            return Err(LpError::Shape(format!(
                "{} '<=' rows declared but only {} rows supplied",
                n_less_eq,
                rows.nrows()
            )));
        }
        for (row, rhs) in rows.column(0).iter().enumerate() {
            if !(*rhs >= 0.0) {
                return Err(LpError::NegativeRhs { row, rhs: *rhs });
            }
        }
        Ok(Self {
            objective,
            rows,
            n_less_eq,
        })
    }

    pub fn n_vars(&self) -> usize {
        self.objective.len()
    }

    pub fn n_constraints(&self) -> usize {
        self.rows.nrows()
    }

    pub fn n_less_eq(&self) -> usize {
        self.n_less_eq
    }

    pub fn n_greater_eq(&self) -> usize {
        self.rows.nrows() - self.n_less_eq
    }

    pub fn objective(&self) -> &'a [f64] {
        self.objective
    }

    pub fn rhs(&self, row: usize) -> f64 {
        self.rows[[row, 0]]
    }

    pub fn coefficients(&self, row: usize) -> ArrayView1<'_, f64> {
        self.rows.row(row).slice_move(ndarray::s![1..])
    }

    pub fn sense(&self, row: usize) -> RowSense {
        if row < self.n_less_eq {
            RowSense::LessEq
        } else {
            RowSense::GreaterEq
        }
    }

    /// `c·x`
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        self.objective.iter().zip(x).map(|(c, v)| c * v).sum()
    }
}

/// An optimum: the objective value and one value per structural variable.
#[derive(Clone, Debug, PartialEq)]
pub struct LpSolution {
    pub objective_value: f64,
    pub values: Vec<f64>,
}

/// Exit-path tallies for one solver instance since its last [`LpSolver::reset`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SolveCounters {
    pub p1_zero_exit: u32,
    pub p1_normal_exit: u32,
    pub p1_relaxed_exit: u32,
    pub p1_art_exit: u32,
    pub p1_art_in_basis: u32,
    pub p1_unbounded: u32,
    pub p1_no_feasible: u32,
    pub p1_too_many_its: u32,
    pub p1_cleanup_bad: u32,
    pub p2_normal_exit: u32,
    pub p2_relaxed_exit: u32,
    pub p2_unbounded: u32,
    pub p2_too_many_its: u32,
}

impl SolveCounters {
    /// True when a solve took a pathological exit: a Phase-1 iteration limit, unbounded
    /// auxiliary problem, infeasibility or a cleanup pivot that moved the Phase-1
    /// objective, or a Phase-2 iteration limit or unbounded direction.
    ///
    /// Artificials left in the basis at the end of Phase 1 are routine on degenerate
    /// problems and are pivoted out, so they are counted but not flagged.
    pub fn check_counters(&self) -> bool {
        self.p1_too_many_its > 0
            || self.p1_unbounded > 0
            || self.p1_no_feasible > 0
            || self.p1_cleanup_bad > 0
            || self.p2_too_many_its > 0
            || self.p2_unbounded > 0
    }

    pub fn merge(&mut self, other: &SolveCounters) {
        self.p1_zero_exit += other.p1_zero_exit;
        self.p1_normal_exit += other.p1_normal_exit;
        self.p1_relaxed_exit += other.p1_relaxed_exit;
        self.p1_art_exit += other.p1_art_exit;
        self.p1_art_in_basis += other.p1_art_in_basis;
        self.p1_unbounded += other.p1_unbounded;
        self.p1_no_feasible += other.p1_no_feasible;
        self.p1_too_many_its += other.p1_too_many_its;
        self.p1_cleanup_bad += other.p1_cleanup_bad;
        self.p2_normal_exit += other.p2_normal_exit;
        self.p2_relaxed_exit += other.p2_relaxed_exit;
        self.p2_unbounded += other.p2_unbounded;
        self.p2_too_many_its += other.p2_too_many_its;
    }
}

/// A reusable LP back end. Instances are owned by a single work area and never shared.
pub trait LpSolver: Send {
    fn name(&self) -> &'static str;

    /// Clears counters and any state left by the previous solve.
    fn reset(&mut self);

    fn solve(&mut self, problem: &LpProblem<'_>, limits: SolveLimits)
    -> Result<LpSolution, LpError>;

    fn counters(&self) -> SolveCounters {
        SolveCounters::default()
    }
}

impl SolverKind {
    pub fn create(self) -> Box<dyn LpSolver> {
        match self {
            SolverKind::Tableau => Box::new(TableauSolver::new()),
            SolverKind::Microlp => Box::new(MicrolpSolver::new()),
        }
    }
}

fn tolerance(eps: f64, reference: f64) -> f64 {
    eps * reference.abs().max(1.0)
}

/// Recomputes `c·x` and compares it with the reported optimum.
pub fn check_objective(
    problem: &LpProblem<'_>,
    solution: &LpSolution,
    eps: f64,
) -> Result<(), LpError> {
    let recomputed = problem.evaluate(&solution.values);
    if (recomputed - solution.objective_value).abs() > tolerance(eps, solution.objective_value) {
        return Err(LpError::ObjectiveCheck {
            reported: solution.objective_value,
            recomputed,
        });
    }
    Ok(())
}

/// Checks one row of the problem against `solution`.
pub fn check_constraint(
    problem: &LpProblem<'_>,
    solution: &LpSolution,
    row: usize,
    eps: f64,
) -> Result<(), LpError> {
    let rhs = problem.rhs(row);
    let lhs: f64 = problem
        .coefficients(row)
        .iter()
        .zip(&solution.values)
        .map(|(a, x)| a * x)
        .sum();
    let tol = tolerance(eps, rhs);
    let violated = match problem.sense(row) {
        RowSense::LessEq => lhs > rhs + tol,
        RowSense::GreaterEq => lhs < rhs - tol,
    };
    if violated {
        return Err(LpError::ConstraintCheck { row, lhs, rhs });
    }
    Ok(())
}

/// Post-solve consistency check: objective, every row, and non-negativity.
pub fn verify_solution(
    problem: &LpProblem<'_>,
    solution: &LpSolution,
    eps: f64,
) -> Result<(), LpError> {
    if solution.values.len() != problem.n_vars() {
        return Err(LpError::Shape(format!(
            "solution has {} values for {} variables",
            solution.values.len(),
            problem.n_vars()
        )));
    }
    check_objective(problem, solution, eps)?;
    for row in 0..problem.n_constraints() {
        check_constraint(problem, solution, row, eps)?;
    }
    if let Some(v) = solution.values.iter().position(|x| *x < -eps) {
        return Err(LpError::ConstraintCheck {
            row: problem.n_constraints() + v,
            lhs: solution.values[v],
            rhs: 0.0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn negative_rhs_is_rejected_before_solving() {
        let c = [1.0, 1.0];
        let rows = array![[1.0, 1.0, 0.0], [-2.0, 0.0, 1.0]];
        let err = LpProblem::new(&c, rows.view(), 2).unwrap_err();
        assert_eq!(err, LpError::NegativeRhs { row: 1, rhs: -2.0 });
    }

    #[test]
    fn row_width_must_match_objective() {
        let c = [1.0, 1.0, 1.0];
        let rows = array![[1.0, 1.0, 0.0]];
        assert!(matches!(
            LpProblem::new(&c, rows.view(), 1),
            Err(LpError::Shape(_))
        ));
    }

    #[test]
    fn row_sense_follows_less_eq_count() {
        let c = [1.0];
        let rows = array![[1.0, 1.0], [0.5, 1.0], [0.0, 1.0]];
        let p = LpProblem::new(&c, rows.view(), 1).unwrap();
        assert_eq!(p.sense(0), RowSense::LessEq);
        assert_eq!(p.sense(1), RowSense::GreaterEq);
        assert_eq!(p.n_greater_eq(), 2);
    }

    #[test]
    fn verification_catches_a_wrong_objective() {
        let c = [3.0, 5.0];
        let rows = array![[4.0, 1.0, 0.0], [12.0, 0.0, 2.0], [18.0, 3.0, 2.0]];
        let p = LpProblem::new(&c, rows.view(), 3).unwrap();
        let good = LpSolution {
            objective_value: 36.0,
            values: vec![2.0, 6.0],
        };
        assert!(verify_solution(&p, &good, 1e-6).is_ok());
        let bad = LpSolution {
            objective_value: 35.0,
            values: vec![2.0, 6.0],
        };
        assert!(matches!(
            verify_solution(&p, &bad, 1e-6),
            Err(LpError::ObjectiveCheck { .. })
        ));
    }

    #[test]
    fn verification_catches_a_violated_row() {
        let c = [1.0, 1.0];
        let rows = array![[1.0, 1.0, 1.0], [1.0, 1.0, 0.0]];
        let p = LpProblem::new(&c, rows.view(), 1).unwrap();
        let sol = LpSolution {
            objective_value: 2.0,
            values: vec![1.0, 1.0],
        };
        assert_eq!(
            check_constraint(&p, &sol, 0, 1e-6),
            Err(LpError::ConstraintCheck {
                row: 0,
                lhs: 2.0,
                rhs: 1.0
            })
        );
        assert!(check_constraint(&p, &sol, 1, 1e-6).is_ok());
    }

    #[test]
    fn pathological_exits_are_flagged() {
        let mut counters = SolveCounters {
            p1_zero_exit: 3,
            p2_normal_exit: 3,
            ..SolveCounters::default()
        };
        assert!(!counters.check_counters());
        counters.merge(&SolveCounters {
            p2_too_many_its: 1,
            ..SolveCounters::default()
        });
        assert!(counters.check_counters());
        assert_eq!(counters.p1_zero_exit, 3);
    }

    #[test]
    fn leftover_artificials_are_not_pathological() {
        let cleaned = SolveCounters {
            p1_normal_exit: 1,
            p1_art_in_basis: 2,
            p2_normal_exit: 1,
            ..SolveCounters::default()
        };
        assert!(!cleaned.check_counters());

        let drifted = SolveCounters {
            p1_cleanup_bad: 1,
            ..cleaned
        };
        assert!(drifted.check_counters());
    }
}
