//! Dense two-phase primal simplex.
//!
//! Tableau layout, for `m` constraints of which `g` are "≥":
//!
//! ```text
//! row 0        objective (phase-1 auxiliary objective while it is running)
//! rows 1..=m   constraints
//! row m + 1    true objective carried through phase 1 ("shadow" row)
//!
//! col 0                 right-hand side / objective value
//! cols 1..=n            structural variables
//! cols n+1..=n+m        one slack per row (+1 for "≤", -1 for "≥")
//! cols n+m+1..          one artificial per "≥" row
//! ```
//!
//! Artificial columns are dropped after phase 1 by shrinking the active column count,
//! so the buffer is allocated once per problem shape and reused across solves.

use super::{
    LpError, LpProblem, LpSolution, LpSolver, PIVOT_TOLERANCE, SolveCounters, SolveLimits,
};
use ndarray::Array2;

#[derive(Debug)]
pub struct TableauSolver {
    tableau: Array2<f64>,
    /// For each column, the row holding its unit entry while it is basic.
    basic_row: Vec<Option<usize>>,
    scratch_row: Vec<f64>,
    n_vars: usize,
    n_constraints: usize,
    n_ge: usize,
    active_cols: usize,
    counters: SolveCounters,
}

impl Default for TableauSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TableauSolver {
    pub fn new() -> Self {
        Self {
            tableau: Array2::zeros((0, 0)),
            basic_row: Vec::new(),
            scratch_row: Vec::new(),
            n_vars: 0,
            n_constraints: 0,
            n_ge: 0,
            active_cols: 0,
            counters: SolveCounters::default(),
        }
    }

    fn shadow_row(&self) -> usize {
        self.n_constraints + 1
    }

    fn slack_col(&self, constraint: usize) -> usize {
        1 + self.n_vars + constraint
    }

    fn artificial_col(&self, k: usize) -> usize {
        1 + self.n_vars + self.n_constraints + k
    }

    fn layout(&mut self, problem: &LpProblem<'_>) {
        self.n_vars = problem.n_vars();
        self.n_constraints = problem.n_constraints();
        self.n_ge = problem.n_greater_eq();
        let ncols = 1 + self.n_vars + self.n_constraints + self.n_ge;
        let nrows = self.n_constraints + 2;

        if self.tableau.dim() == (nrows, ncols) {
            self.tableau.fill(0.0);
        } else {
            self.tableau = Array2::zeros((nrows, ncols));
        }
        self.basic_row.clear();
        self.basic_row.resize(ncols, None);
        self.scratch_row.resize(ncols, 0.0);
        self.active_cols = ncols;

        let n_le = problem.n_less_eq();
        for r in 0..self.n_constraints {
            let row = r + 1;
            self.tableau[[row, 0]] = problem.rhs(r);
            for (v, coef) in problem.coefficients(r).iter().enumerate() {
                self.tableau[[row, 1 + v]] = *coef;
            }
            let slack = self.slack_col(r);
            if r < n_le {
                self.tableau[[row, slack]] = 1.0;
                self.basic_row[slack] = Some(row);
            } else {
                self.tableau[[row, slack]] = -1.0;
                let art = self.artificial_col(r - n_le);
                self.tableau[[row, art]] = 1.0;
                self.basic_row[art] = Some(row);
            }
        }

        let objective_row = if self.n_ge == 0 { 0 } else { self.shadow_row() };
        for (v, c) in problem.objective().iter().enumerate() {
            self.tableau[[objective_row, 1 + v]] = -c;
        }

        if self.n_ge > 0 {
            // Auxiliary objective: maximize the negated sum of artificials, expressed over
            // the non-basic columns.
            for r in n_le..self.n_constraints {
                let row = r + 1;
                self.tableau[[0, 0]] -= self.tableau[[row, 0]];
                for col in 1..ncols {
                    if self.basic_row[col].is_none() {
                        self.tableau[[0, col]] -= self.tableau[[row, col]];
                    }
                }
            }
        }
    }

    /// Most negative entry of the top row; the first one wins ties.
    fn entering_column(&self) -> Option<usize> {
        let mut best = None;
        let mut lowest = 0.0;
        for col in 1..self.active_cols {
            let v = self.tableau[[0, col]];
            if v < lowest {
                lowest = v;
                best = Some(col);
            }
        }
        best
    }

    /// Minimum-ratio row among rows with a usable pivot in `col`.
    fn leaving_row(&self, col: usize) -> Option<usize> {
        let mut best = None;
        let mut lowest_ratio = f64::INFINITY;
        for row in 1..=self.n_constraints {
            let pivot = self.tableau[[row, col]];
            if pivot > PIVOT_TOLERANCE {
                let ratio = self.tableau[[row, 0]] / pivot;
                if ratio < lowest_ratio {
                    lowest_ratio = ratio;
                    best = Some(row);
                }
            }
        }
        best
    }

    fn pivot(&mut self, pivot_row: usize, pivot_col: usize, include_shadow: bool) {
        if let Some(leaving) =
            (1..self.active_cols).find(|&c| self.basic_row[c] == Some(pivot_row))
        {
            self.basic_row[leaving] = None;
        }
        self.basic_row[pivot_col] = Some(pivot_row);

        let cols = self.active_cols;
        let pivot = self.tableau[[pivot_row, pivot_col]];
        for c in 0..cols {
            let scaled = self.tableau[[pivot_row, c]] / pivot;
            self.tableau[[pivot_row, c]] = scaled;
            self.scratch_row[c] = scaled;
        }

        let last = if include_shadow {
            self.shadow_row()
        } else {
            self.n_constraints
        };
        for row in 0..=last {
            if row == pivot_row {
                continue;
            }
            let factor = self.tableau[[row, pivot_col]];
            if factor == 0.0 {
                continue;
            }
            for c in 0..cols {
                self.tableau[[row, c]] -= factor * self.scratch_row[c];
            }
        }
    }

    /// Row of the first artificial variable still in the basis.
    fn basic_artificial(&self) -> Option<usize> {
        (0..self.n_ge).find_map(|k| self.basic_row[self.artificial_col(k)])
    }

    fn phase_one(&mut self, max_iters: usize, eps: f64) -> Result<(), LpError> {
        let mut iters = 0;
        loop {
            if self.tableau[[0, 0]] >= 0.0 {
                self.counters.p1_zero_exit += 1;
                break;
            }
            if self.basic_artificial().is_none() {
                self.counters.p1_art_exit += 1;
                break;
            }
            let Some(col) = self.entering_column() else {
                self.counters.p1_normal_exit += 1;
                break;
            };
            if self.tableau[[0, col]] > -eps {
                self.counters.p1_relaxed_exit += 1;
                break;
            }
            if iters == max_iters {
                self.counters.p1_too_many_its += 1;
                return Err(LpError::IterationLimit { max_iters });
            }
            let Some(row) = self.leaving_row(col) else {
                self.counters.p1_unbounded += 1;
                return Err(LpError::Unbounded);
            };
            self.pivot(row, col, true);
            iters += 1;
        }

        if self.tableau[[0, 0]] < -eps {
            self.counters.p1_no_feasible += 1;
            return Err(LpError::Infeasible);
        }

        // Artificials still basic sit at zero level; swap them for the largest entry of
        // their row among structural and slack columns.
        let real_cols = self.n_vars + self.n_constraints;
        while let Some(row) = self.basic_artificial() {
            self.counters.p1_art_in_basis += 1;
            let mut best_col = 0;
            let mut best_mag = 0.0;
            for col in 1..=real_cols {
                let mag = self.tableau[[row, col]].abs();
                if mag > best_mag {
                    best_mag = mag;
                    best_col = col;
                }
            }
            if best_mag < PIVOT_TOLERANCE {
                return Err(LpError::RankDeficient { row: row - 1 });
            }
            let before = self.tableau[[0, 0]];
            self.pivot(row, best_col, true);
            if (self.tableau[[0, 0]] - before).abs() > eps {
                self.counters.p1_cleanup_bad += 1;
            }
        }

        let shadow = self.shadow_row();
        self.active_cols = 1 + real_cols;
        for col in 0..self.active_cols {
            self.tableau[[0, col]] = self.tableau[[shadow, col]];
        }
        Ok(())
    }

    fn phase_two(&mut self, max_iters: usize, eps: f64) -> Result<(), LpError> {
        let mut iters = 0;
        loop {
            let Some(col) = self.entering_column() else {
                self.counters.p2_normal_exit += 1;
                return Ok(());
            };
            if self.tableau[[0, col]] > -eps {
                self.counters.p2_relaxed_exit += 1;
                return Ok(());
            }
            if iters == max_iters {
                self.counters.p2_too_many_its += 1;
                return Err(LpError::IterationLimit { max_iters });
            }
            let Some(row) = self.leaving_row(col) else {
                self.counters.p2_unbounded += 1;
                return Err(LpError::Unbounded);
            };
            self.pivot(row, col, false);
            iters += 1;
        }
    }

    fn extract(&self) -> LpSolution {
        let values = (0..self.n_vars)
            .map(|v| {
                self.basic_row[1 + v]
                    .map(|row| self.tableau[[row, 0]])
                    .unwrap_or(0.0)
            })
            .collect();
        LpSolution {
            objective_value: self.tableau[[0, 0]],
            values,
        }
    }
}

impl LpSolver for TableauSolver {
    fn name(&self) -> &'static str {
        "tableau"
    }

    fn reset(&mut self) {
        self.counters = SolveCounters::default();
        self.basic_row.iter_mut().for_each(|b| *b = None);
    }

    fn solve(
        &mut self,
        problem: &LpProblem<'_>,
        limits: SolveLimits,
    ) -> Result<LpSolution, LpError> {
        self.layout(problem);
        if self.n_ge > 0 {
            self.phase_one(limits.max_iters, limits.eps)?;
        }
        self.phase_two(limits.max_iters, limits.eps)?;
        Ok(self.extract())
    }

    fn counters(&self) -> SolveCounters {
        self.counters
    }
}
