//! [`LpSolver`] backed by the `microlp` crate.
//!
//! `microlp` runs its own bounded-variable simplex and exposes no iteration cap, so only
//! `eps` from [`SolveLimits`] is honoured: values within `eps` of zero are snapped to zero.
//! Exit tallies are mapped onto the phase-1 and phase-2 counters.

use super::{LpError, LpProblem, LpSolution, LpSolver, RowSense, SolveCounters, SolveLimits};
use microlp::{ComparisonOp, OptimizationDirection, Problem, Variable};

#[derive(Debug, Default)]
pub struct MicrolpSolver {
    counters: SolveCounters,
    vars: Vec<Variable>,
    terms: Vec<(Variable, f64)>,
}

impl MicrolpSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LpSolver for MicrolpSolver {
    fn name(&self) -> &'static str {
        "microlp"
    }

    fn reset(&mut self) {
        self.counters = SolveCounters::default();
        self.vars.clear();
        self.terms.clear();
    }

    fn solve(
        &mut self,
        problem: &LpProblem<'_>,
        limits: SolveLimits,
    ) -> Result<LpSolution, LpError> {
        let mut lp = Problem::new(OptimizationDirection::Maximize);
        self.vars.clear();
        self.vars.extend(
            problem
                .objective()
                .iter()
                .map(|c| lp.add_var(*c, (0.0, f64::INFINITY))),
        );

        for row in 0..problem.n_constraints() {
            self.terms.clear();
            self.terms.extend(
                self.vars
                    .iter()
                    .copied()
                    .zip(problem.coefficients(row).iter().copied())
                    .filter(|(_, coef)| *coef != 0.0),
            );
            let op = match problem.sense(row) {
                RowSense::LessEq => ComparisonOp::Le,
                RowSense::GreaterEq => ComparisonOp::Ge,
            };
            lp.add_constraint(self.terms.as_slice(), op, problem.rhs(row));
        }

        match lp.solve() {
            Ok(solution) => {
                self.counters.p2_normal_exit += 1;
                Ok(LpSolution {
                    objective_value: solution.objective(),
                    values: self
                        .vars
                        .iter()
                        .map(|v| {
                            let x = solution[*v];
                            if x.abs() < limits.eps { 0.0 } else { x }
                        })
                        .collect(),
                })
            }
            Err(microlp::Error::Infeasible) => {
                self.counters.p1_no_feasible += 1;
                Err(LpError::Infeasible)
            }
            Err(microlp::Error::Unbounded) => {
                self.counters.p2_unbounded += 1;
                Err(LpError::Unbounded)
            }
            Err(microlp::Error::InternalError(msg)) => Err(LpError::Backend(msg)),
        }
    }

    fn counters(&self) -> SolveCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplex::{TableauSolver, verify_solution};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn agrees_with_the_tableau_on_a_mixed_problem() {
        let rows = array![
            [10.0, 1.0, 0.0],
            [10.0, 0.0, 1.0],
            [4.0, 1.0, 2.0],
            [6.0, 3.0, 1.0]
        ];
        let problem = LpProblem::new(&[-1.0, -1.0], rows.view(), 2).unwrap();
        let ours = TableauSolver::new()
            .solve(&problem, SolveLimits::for_vars(2))
            .unwrap();
        let theirs = MicrolpSolver::new()
            .solve(&problem, SolveLimits::for_vars(2))
            .unwrap();
        verify_solution(&problem, &theirs, 1e-6).unwrap();
        assert_abs_diff_eq!(ours.objective_value, theirs.objective_value, epsilon = 1e-6);
        assert_abs_diff_eq!(theirs.values[0], 1.6, epsilon = 1e-6);
        assert_abs_diff_eq!(theirs.values[1], 1.2, epsilon = 1e-6);
    }

    #[test]
    fn infeasibility_is_reported() {
        let rows = array![[1.0, 1.0], [5.0, 1.0]];
        let problem = LpProblem::new(&[1.0], rows.view(), 1).unwrap();
        let mut solver = MicrolpSolver::new();
        assert_eq!(
            solver.solve(&problem, SolveLimits::for_vars(2)),
            Err(LpError::Infeasible)
        );
        assert!(solver.counters().check_counters());
        solver.reset();
        assert_eq!(solver.counters(), SolveCounters::default());
    }
}
