use approx::assert_relative_eq;
use lfs::SolverKind;
use lfs::case::selection_constraints;
use lfs::simplex::{LpError, LpProblem, SolveLimits, verify_solution};
use ndarray::{Array2, array, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BACKENDS: [SolverKind; 2] = [SolverKind::Tableau, SolverKind::Microlp];

#[test]
fn mixed_constraints_agree_across_backends() {
    // max 3x + 2y  s.t. x + y <= 4, x + 3y <= 6, x >= 1, y >= 0.5
    let objective = [3.0, 2.0];
    let rows = array![[4.0, 1.0, 1.0], [6.0, 1.0, 3.0], [1.0, 1.0, 0.0], [0.5, 0.0, 1.0]];
    let problem = LpProblem::new(&objective, rows.view(), 2).unwrap();
    for kind in BACKENDS {
        let mut solver = kind.create();
        let solution = solver.solve(&problem, SolveLimits::for_vars(2)).unwrap();
        assert_relative_eq!(solution.objective_value, 11.5, epsilon = 1e-9);
        assert_relative_eq!(solution.values[0], 3.5, epsilon = 1e-9);
        assert_relative_eq!(solution.values[1], 0.5, epsilon = 1e-9);
        verify_solution(&problem, &solution, 1e-6).unwrap();
    }
}

#[test]
fn contradictory_bounds_are_infeasible() {
    let objective = [1.0];
    let rows = array![[1.0, 1.0], [5.0, 1.0]];
    let problem = LpProblem::new(&objective, rows.view(), 1).unwrap();
    for kind in BACKENDS {
        let mut solver = kind.create();
        assert_eq!(
            solver.solve(&problem, SolveLimits::for_vars(1)),
            Err(LpError::Infeasible),
            "{kind}"
        );
    }
}

#[test]
fn negative_rhs_is_rejected_before_solving() {
    let objective = [1.0, 1.0];
    let rows = array![[-1.0, 1.0, 1.0]];
    assert!(matches!(
        LpProblem::new(&objective, rows.view(), 1),
        Err(LpError::NegativeRhs { row: 0, .. })
    ));
}

/// The two problems a case solves, built from random spreads.
#[test]
fn selection_problems_agree_across_backends() {
    let mut rng = StdRng::seed_from_u64(0x1f5);
    for trial in 0..25 {
        let n_vars = rng.gen_range(2..12);
        let max_kept = rng.gen_range(1..=n_vars.min(4));
        let a: Vec<f64> = (0..n_vars).map(|_| -rng.gen_range(0.1..10.0)).collect();
        let b: Vec<f64> = (0..n_vars).map(|_| rng.gen_range(0.0..10.0)).collect();
        let shared = selection_constraints(n_vars, max_kept);

        let inter = LpProblem::new(&b, shared.view(), n_vars + 1).unwrap();
        let mut eps_max = Vec::new();
        for kind in BACKENDS {
            let mut solver = kind.create();
            let solution = solver.solve(&inter, SolveLimits::for_vars(n_vars)).unwrap();
            verify_solution(&inter, &solution, 1e-6).unwrap();
            eps_max.push(solution.objective_value);
        }
        assert_relative_eq!(eps_max[0], eps_max[1], max_relative = 1e-9, epsilon = 1e-9);

        let beta = rng.gen_range(0.05..0.95);
        let mut rows = Array2::zeros((n_vars + 3, n_vars + 1));
        rows.slice_mut(s![..n_vars + 2, ..]).assign(&shared);
        rows[[n_vars + 2, 0]] = beta * eps_max[0] + 1e-9;
        for (v, coef) in b.iter().enumerate() {
            rows[[n_vars + 2, v + 1]] = *coef;
        }
        let intra = LpProblem::new(&a, rows.view(), n_vars + 1).unwrap();
        let mut optimum = Vec::new();
        for kind in BACKENDS {
            let mut solver = kind.create();
            let solution = solver
                .solve(&intra, SolveLimits::for_vars(n_vars))
                .unwrap_or_else(|e| panic!("trial {trial} on {kind}: {e}"));
            verify_solution(&intra, &solution, 1e-6).unwrap();
            optimum.push(solution.objective_value);
        }
        assert_relative_eq!(optimum[0], optimum[1], max_relative = 1e-7, epsilon = 1e-9);
    }
}

#[test]
fn reset_solver_repeats_itself_exactly() {
    let objective = [2.0, -1.0, 0.5];
    let rows = array![
        [1.0, 1.0, 0.0, 0.0],
        [1.0, 0.0, 1.0, 0.0],
        [1.0, 0.0, 0.0, 1.0],
        [2.0, 1.0, 1.0, 1.0],
        [1.0, 1.0, 1.0, 1.0]
    ];
    let problem = LpProblem::new(&objective, rows.view(), 4).unwrap();
    for kind in BACKENDS {
        let mut solver = kind.create();
        let first = solver.solve(&problem, SolveLimits::for_vars(3)).unwrap();
        solver.reset();
        let second = solver.solve(&problem, SolveLimits::for_vars(3)).unwrap();
        assert_eq!(first, second, "{kind}");
        assert_relative_eq!(first.objective_value, 2.5, epsilon = 1e-9);
    }
}
