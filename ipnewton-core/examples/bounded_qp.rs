//! Bounded QP example demonstrating the Newton engine.
//!
//! Solves:
//!   minimize    ½·(x1² + x2²) + x1
//!   subject to  x1 + x2 = 1
//!               0 ≤ x1, x2 ≤ 2
//!
//! Optimal solution: x1 = 0, x2 = 1 with x1 pinned to its lower bound.

use nalgebra::{DMatrix, DVector};

use ipnewton_core::{Dims, MasterProblem, Solver, SolverSettings, State};

fn main() {
    println!("ipnewton - Bounded QP Example");
    println!("=============================");
    println!();

    let dims = Dims::new(2, 0, 1, 0);

    let problem = MasterProblem {
        dims,
        ax: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
        ap: DMatrix::zeros(1, 0),
        b: DVector::from_row_slice(&[1.0]),
        xlower: DVector::from_row_slice(&[0.0, 0.0]),
        xupper: DVector::from_row_slice(&[2.0, 2.0]),
        f: Box::new(|x, _p, req, out| {
            out.f = 0.5 * x.dot(x) + x[0];
            if req.derivatives {
                out.fx.copy_from(x);
                out.fx[0] += 1.0;
                out.fxx.fill_with_identity();
                out.fxx_diagonal = true;
            }
            true
        }),
        h: None,
        v: None,
    };

    let mut solver = match Solver::new(problem) {
        Ok(solver) => solver,
        Err(e) => {
            eprintln!("Problem rejected: {e}");
            std::process::exit(1);
        }
    };
    solver.set_settings(SolverSettings {
        verbose: true,
        ..Default::default()
    });

    let mut state = State::new(dims);
    state.u.x[0] = 0.5;
    state.u.x[1] = 0.5;

    match solver.solve(&mut state) {
        Ok(result) => {
            println!("\n=== Solution ===");
            println!("succeeded: {}", result.succeeded);
            if let Some(reason) = &result.failure_reason {
                println!("failure reason: {reason}");
            }
            println!("x1 = {:.6}", state.u.x[0]);
            println!("x2 = {:.6}", state.u.x[1]);
            println!("y  = {:.6}", state.u.w[0]);
            println!("stability: {:?}", state.stability);
            println!("iterations: {}", result.iterations);
            println!(
                "errors: optimality {:.3e}, feasibility {:.3e}",
                result.error_optimality, result.error_feasibility
            );

            let sum = state.u.x[0] + state.u.x[1];
            println!("\nConstraint verification: x1 + x2 = {sum:.6} (should be 1.0)");
        }
        Err(e) => {
            eprintln!("Solver failed: {e}");
            std::process::exit(1);
        }
    }
}
