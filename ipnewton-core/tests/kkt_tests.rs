//! Saddle-point solver battery: strategy agreement and residual bounds on
//! randomly generated well-conditioned systems.

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use ipnewton_core::kkt::{KktAssembly, KktMethod, SaddlePointSolver};
use ipnewton_core::{Dims, MasterVector};

struct SaddleCase {
    h: DMatrix<f64>,
    diagonal: bool,
    w: DMatrix<f64>,
    g: DVector<f64>,
    b: DVector<f64>,
    u: MasterVector,
}

fn random_case(seed: u64, nx: usize, nw: usize, diagonal: bool) -> SaddleCase {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let h = if diagonal {
        DMatrix::from_fn(nx, nx, |i, j| {
            if i == j {
                1.0 + rng.gen::<f64>()
            } else {
                0.0
            }
        })
    } else {
        // Diagonally dominant symmetric block, positive definite.
        let a = DMatrix::from_fn(nx, nx, |_, _| rng.gen::<f64>() - 0.5);
        let mut h = &a * a.transpose();
        for i in 0..nx {
            h[(i, i)] += nx as f64;
        }
        h
    };

    let w = DMatrix::from_fn(nw, nx, |_, _| rng.gen::<f64>() * 2.0 - 1.0);
    let g = DVector::from_fn(nx, |_, _| rng.gen::<f64>() * 2.0 - 1.0);
    let b = DVector::from_fn(nw, |_, _| rng.gen::<f64>() * 2.0 - 1.0);

    let dims = Dims::new(nx, 0, nw, 0);
    let mut u = MasterVector::zeros(dims);
    for i in 0..nx {
        u.x[i] = rng.gen::<f64>() * 4.0 - 2.0;
    }

    SaddleCase {
        h,
        diagonal,
        w,
        g,
        b,
        u,
    }
}

fn solve_case(case: &SaddleCase, method: KktMethod) -> (MasterVector, KktMethod) {
    let nx = case.h.nrows();
    let nw = case.w.nrows();
    let dims = Dims::new(nx, 0, nw, 0);

    let empty_x = DMatrix::zeros(nx, 0);
    let vx = DMatrix::zeros(0, nx);
    let vp = DMatrix::zeros(0, 0);
    let wp = DMatrix::zeros(nw, 0);
    let weights = DVector::from_fn(nx, |i, _| case.u.x[i].abs().max(0.5));
    let stable: Vec<usize> = (0..nx).collect();

    let mut sps = SaddlePointSolver::new(dims, method);
    sps.decompose(KktAssembly {
        hxx: &case.h,
        hxx_diagonal: case.diagonal,
        hxp: &empty_x,
        vx: &vx,
        vp: &vp,
        wx: &case.w,
        wp: &wp,
        x: &case.u.x,
        weights: &weights,
        stable: &stable,
        unstable: &[],
        proximal_rho: 0.0,
    })
    .expect("decompose failed");

    let effective = sps.effective_method();

    let h_empty = DVector::zeros(0);
    let v_empty = DVector::zeros(0);
    let mut sol = MasterVector::zeros(dims);
    sps.solve(&case.g, &case.b, &h_empty, &v_empty, &case.u, &mut sol)
        .expect("solve failed");
    (sol, effective)
}

/// Residual of the assembled saddle-point system at the computed solution.
fn residuals(case: &SaddleCase, sol: &MasterVector) -> (f64, f64) {
    let rx_target = &case.h * &case.u.x - &case.g;
    let opt = (&case.h * &sol.x + case.w.transpose() * &sol.w - rx_target).amax();
    let feas = (&case.w * &sol.x - &case.b).amax();
    (opt, feas)
}

#[test]
fn test_rangespace_agrees_with_fullspace() {
    for seed in 0..8u64 {
        let case = random_case(seed, 8, 3, true);

        let (sol_full, _) = solve_case(&case, KktMethod::Fullspace);
        let (sol_range, eff) = solve_case(&case, KktMethod::Rangespace);
        assert_eq!(eff, KktMethod::Rangespace, "rangespace fell back unexpectedly");

        let dx = (&sol_full.x - &sol_range.x).amax();
        let dw = (&sol_full.w - &sol_range.w).amax();
        assert!(dx < 1e-10, "seed {seed}: primal disagreement {dx:.3e}");
        assert!(dw < 1e-10, "seed {seed}: dual disagreement {dw:.3e}");
    }
}

#[test]
fn test_nullspace_agrees_with_fullspace() {
    for seed in 0..8u64 {
        let case = random_case(seed, 7, 3, false);

        let (sol_full, _) = solve_case(&case, KktMethod::Fullspace);
        let (sol_null, eff) = solve_case(&case, KktMethod::Nullspace);
        assert_eq!(eff, KktMethod::Nullspace);

        let dx = (&sol_full.x - &sol_null.x).amax();
        let dw = (&sol_full.w - &sol_null.w).amax();
        assert!(dx < 1e-10, "seed {seed}: primal disagreement {dx:.3e}");
        assert!(dw < 1e-10, "seed {seed}: dual disagreement {dw:.3e}");
    }
}

#[test]
fn test_saddle_residual_bound() {
    for seed in 0..8u64 {
        for (diagonal, method) in [
            (true, KktMethod::Rangespace),
            (false, KktMethod::Nullspace),
            (false, KktMethod::Fullspace),
        ] {
            let case = random_case(seed, 9, 4, diagonal);
            let (sol, _) = solve_case(&case, method);
            let (opt, feas) = residuals(&case, &sol);
            let scale = case.g.amax().max(case.b.amax()).max(1.0);
            assert!(
                opt < 1e-9 * scale,
                "seed {seed} {method:?}: optimality residual {opt:.3e}"
            );
            assert!(
                feas < 1e-9 * scale,
                "seed {seed} {method:?}: feasibility residual {feas:.3e}"
            );
        }
    }
}

#[test]
fn test_unstable_variables_are_pinned() {
    // Mark one variable unstable: its solution component must stay at the
    // current iterate and the remaining system must still be consistent.
    let case = random_case(42, 6, 2, true);
    let nx = 6;
    let nw = 2;
    let dims = Dims::new(nx, 0, nw, 0);

    let empty_x = DMatrix::zeros(nx, 0);
    let vx = DMatrix::zeros(0, nx);
    let vp = DMatrix::zeros(0, 0);
    let wp = DMatrix::zeros(nw, 0);
    // The unstable variable gets a negative priority weight so it leaves the
    // basic set.
    let weights = DVector::from_fn(nx, |i, _| if i == 3 { -1.0 } else { 1.0 });
    let stable: Vec<usize> = (0..nx).filter(|&i| i != 3).collect();
    let unstable = [3usize];

    let mut sps = SaddlePointSolver::new(dims, KktMethod::Rangespace);
    sps.decompose(KktAssembly {
        hxx: &case.h,
        hxx_diagonal: true,
        hxp: &empty_x,
        vx: &vx,
        vp: &vp,
        wx: &case.w,
        wp: &wp,
        x: &case.u.x,
        weights: &weights,
        stable: &stable,
        unstable: &unstable,
        proximal_rho: 0.0,
    })
    .unwrap();

    let h_empty = DVector::zeros(0);
    let v_empty = DVector::zeros(0);
    let mut sol = MasterVector::zeros(dims);
    sps.solve(&case.g, &case.b, &h_empty, &v_empty, &case.u, &mut sol)
        .unwrap();

    assert_eq!(sol.x[3], case.u.x[3], "unstable variable moved");

    // Constraints hold with the pinned variable's contribution included.
    let feas = (&case.w * &sol.x - &case.b).amax();
    assert!(feas < 1e-9, "feasibility violated: {feas:.3e}");
}

#[test]
fn test_sensitivities_match_direct_solve() {
    // ∂/∂c with dg/dc = e_k is the solution of the same KKT system with
    // right-hand side (−e_k, 0); compare against a direct fullspace solve of
    // the delta system.
    let case = random_case(7, 5, 2, true);
    let nx = 5;
    let nw = 2;
    let dims = Dims::new(nx, 0, nw, 0);

    let empty_x = DMatrix::zeros(nx, 0);
    let vx = DMatrix::zeros(0, nx);
    let vp = DMatrix::zeros(0, 0);
    let wp = DMatrix::zeros(nw, 0);
    let weights = DVector::from_fn(nx, |i, _| case.u.x[i].abs().max(0.5));
    let stable: Vec<usize> = (0..nx).collect();

    let mut sps = SaddlePointSolver::new(dims, KktMethod::Rangespace);
    sps.decompose(KktAssembly {
        hxx: &case.h,
        hxx_diagonal: true,
        hxp: &empty_x,
        vx: &vx,
        vp: &vp,
        wx: &case.w,
        wp: &wp,
        x: &case.u.x,
        weights: &weights,
        stable: &stable,
        unstable: &[],
        proximal_rho: 0.0,
    })
    .unwrap();

    let dgdc = DMatrix::identity(nx, nx);
    let dbdc = DMatrix::zeros(nw, nx);
    let dhdc = DMatrix::zeros(0, nx);
    let mut sens = ipnewton_core::Sensitivities {
        dxdc: DMatrix::zeros(nx, nx),
        dpdc: DMatrix::zeros(0, nx),
        dwdc: DMatrix::zeros(nw, nx),
        dzdc: DMatrix::zeros(nx, nx),
    };
    sps.sensitivities(&dgdc, &dbdc, &dhdc, None, &mut sens).unwrap();

    // Direct dense solve of [H Wᵀ; W 0]·d = [−e_k; 0].
    let t = nx + nw;
    let mut m = DMatrix::zeros(t, t);
    m.view_mut((0, 0), (nx, nx)).copy_from(&case.h);
    m.view_mut((0, nx), (nx, nw)).copy_from(&case.w.transpose());
    m.view_mut((nx, 0), (nw, nx)).copy_from(&case.w);
    let m_inv = m.try_inverse().expect("well-conditioned KKT matrix");

    for k in 0..nx {
        let mut rhs = DVector::zeros(t);
        rhs[k] = -1.0;
        let d = &m_inv * rhs;
        for i in 0..nx {
            assert!(
                (sens.dxdc[(i, k)] - d[i]).abs() < 1e-9,
                "dx[{i}]/dc[{k}]: {} vs {}",
                sens.dxdc[(i, k)],
                d[i]
            );
        }
        for r in 0..nw {
            assert!(
                (sens.dwdc[(r, k)] - d[nx + r]).abs() < 1e-9,
                "dw[{r}]/dc[{k}]: {} vs {}",
                sens.dwdc[(r, k)],
                d[nx + r]
            );
        }
    }
}
