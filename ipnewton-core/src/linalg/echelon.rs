//! Weighted echelon (canonical) form of a rectangular matrix.
//!
//! For a coefficient matrix A (m×n, n ≥ m) the echelonizer maintains a
//! non-singular row mixer R and a column permutation Q such that
//!
//! ```text
//! R · A · Q = [I S]
//! ```
//!
//! on the leading `rank` rows, with the remaining rows zero up to round-off.
//! Columns forming the identity block are the *basic* columns; the rest are
//! *non-basic*. The form is maintained incrementally: a basic column can be
//! swapped with a non-basic one through a single pivot on S, and the whole
//! partition can be re-ordered greedily under per-column priority weights so
//! that heavily weighted columns end up basic. This is what keeps the
//! rangespace KKT reduction well conditioned as iterates approach bounds.
//!
//! Round-off accumulated by repeated pivoting is controlled two ways: a
//! snapshot of the freshly computed form can be restored with `reset`, and
//! `clean_roundoff` scrubs residual noise below σ·ε by adding and subtracting
//! a power of ten σ derived from the magnitude of A.

use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector};

use super::lu::DenseLu;

#[derive(Debug, Clone)]
pub struct Echelonizer {
    /// Number of equations (rows of A).
    m: usize,
    /// Number of variables (columns of A).
    n: usize,
    /// Numerical rank of A, also the number of basic columns.
    rank: usize,
    /// Row mixer R (m×m).
    r: DMatrix<f64>,
    /// The matrix S of the canonical form [I S] (rank × (n − rank)).
    s: DMatrix<f64>,
    /// Column permutation: q[k] is the original column at canonical position k.
    q: Vec<usize>,
    /// Row permutation of the underlying LU (original row at permuted position k).
    p: Vec<usize>,
    /// Pivot comparison threshold.
    threshold: f64,
    /// Round-off scrub constant: 10^(1 + ceil(log10(max|A|))).
    sigma: f64,
    // Snapshot taken at compute() for reset().
    r0: DMatrix<f64>,
    s0: DMatrix<f64>,
    q0: Vec<usize>,
    // Swap workspace: copy of the pivot column of S.
    mwork: DVector<f64>,
    lu: DenseLu,
}

impl Echelonizer {
    pub fn new() -> Self {
        Self {
            m: 0,
            n: 0,
            rank: 0,
            r: DMatrix::zeros(0, 0),
            s: DMatrix::zeros(0, 0),
            q: Vec::new(),
            p: Vec::new(),
            threshold: 0.0,
            sigma: 0.0,
            r0: DMatrix::zeros(0, 0),
            s0: DMatrix::zeros(0, 0),
            q0: Vec::new(),
            mwork: DVector::zeros(0),
            lu: DenseLu::new(),
        }
    }

    /// Compute the canonical form of the given matrix.
    pub fn compute(&mut self, a: &DMatrix<f64>) {
        let m = a.nrows();
        let n = a.ncols();
        assert!(
            n >= m,
            "cannot echelonize a matrix with more rows than columns ({m}×{n})"
        );

        self.m = m;
        self.n = n;
        self.lu.decompose(a);
        let rank = self.lu.rank();
        self.rank = rank;
        self.q = self.lu.col_permutation().to_vec();
        self.p = self.lu.row_permutation().to_vec();
        self.threshold = self.lu.threshold();

        let packed = self.lu.packed().clone_owned();

        // R = Ubb^{-1} · L^{-1} · P. Start from the permutation matrix and run
        // forward substitution with the packed unit-lower factor, then back
        // substitution with the leading rank block of U on the top rows.
        let mut r = DMatrix::zeros(m, m);
        for k in 0..m {
            r[(k, self.p[k])] = 1.0;
        }
        for k in 1..m {
            for j in 0..k.min(m) {
                let l = packed[(k, j)];
                if l != 0.0 {
                    for c in 0..m {
                        let upd = l * r[(j, c)];
                        r[(k, c)] -= upd;
                    }
                }
            }
        }
        for k in (0..rank).rev() {
            for j in (k + 1)..rank {
                let u = packed[(k, j)];
                if u != 0.0 {
                    for c in 0..m {
                        let upd = u * r[(j, c)];
                        r[(k, c)] -= upd;
                    }
                }
            }
            let piv = packed[(k, k)];
            for c in 0..m {
                r[(k, c)] /= piv;
            }
        }
        self.r = r;

        // S = Ubb^{-1} · Ubn.
        let nn = n - rank;
        let mut s = DMatrix::zeros(rank, nn);
        for j in 0..nn {
            for i in 0..rank {
                s[(i, j)] = packed[(i, rank + j)];
            }
        }
        for k in (0..rank).rev() {
            for j in (k + 1)..rank {
                let u = packed[(k, j)];
                if u != 0.0 {
                    for c in 0..nn {
                        let upd = u * s[(j, c)];
                        s[(k, c)] -= upd;
                    }
                }
            }
            let piv = packed[(k, k)];
            for c in 0..nn {
                s[(k, c)] /= piv;
            }
        }
        self.s = s;

        // Scrub constant from the magnitude of A.
        let amax = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        self.sigma = if amax == 0.0 {
            0.0
        } else {
            10.0_f64.powf(1.0 + amax.log10().ceil())
        };

        self.mwork = DVector::zeros(rank);

        self.r0 = self.r.clone();
        self.s0 = self.s.clone();
        self.q0 = self.q.clone();
    }

    /// Swap the basic column at canonical row `ib` with the non-basic column
    /// at canonical position `inb`, pivoting on S[ib, inb].
    pub fn swap(&mut self, ib: usize, inb: usize) {
        let rank = self.rank;
        assert!(ib < rank, "basic index {ib} out of range (rank {rank})");
        assert!(
            inb < self.n - rank,
            "non-basic index {inb} out of range ({} non-basic)",
            self.n - rank
        );
        assert!(
            self.s[(ib, inb)].abs() > self.threshold,
            "refusing to swap on a zero pivot S[{ib}, {inb}] = {}",
            self.s[(ib, inb)]
        );

        self.mwork.copy_from(&self.s.column(inb));
        let aux = 1.0 / self.s[(ib, inb)];

        // Row operations on R (top rank rows only; the rest track linearly
        // dependent equations and stay untouched).
        for c in 0..self.m {
            self.r[(ib, c)] *= aux;
        }
        for i in 0..rank {
            if i == ib {
                continue;
            }
            let f = self.mwork[i];
            if f != 0.0 {
                for c in 0..self.m {
                    let upd = f * self.r[(ib, c)];
                    self.r[(i, c)] -= upd;
                }
            }
        }

        // Same operations on S, then rewrite the pivot column.
        let nn = self.n - rank;
        for c in 0..nn {
            self.s[(ib, c)] *= aux;
        }
        for i in 0..rank {
            if i == ib {
                continue;
            }
            let f = self.mwork[i];
            if f != 0.0 {
                for c in 0..nn {
                    let upd = f * self.s[(ib, c)];
                    self.s[(i, c)] -= upd;
                }
            }
        }
        for i in 0..rank {
            self.s[(i, inb)] = -self.mwork[i] * aux;
        }
        self.s[(ib, inb)] = aux;

        self.q.swap(ib, rank + inb);
    }

    /// Re-order the canonical form under per-column priority weights.
    ///
    /// Basic columns whose weight is beaten by |S[i,j]|·w[j] of some non-basic
    /// column are swapped out, then both partitions are stable-sorted by
    /// descending weight.
    pub fn update_weights(&mut self, w: &DVector<f64>) {
        assert_eq!(
            w.len(),
            self.n,
            "expected {} priority weights, got {}",
            self.n,
            w.len()
        );

        let nb = self.rank;
        let nn = self.n - nb;

        if nn > 0 {
            for i in 0..nb {
                let wi = w[self.q[i]];
                let mut jmax = 0usize;
                let mut max = f64::NEG_INFINITY;
                for k in 0..nn {
                    if self.s[(i, k)].abs() <= self.threshold {
                        continue;
                    }
                    let tmp = w[self.q[nb + k]] * self.s[(i, k)].abs();
                    if tmp > max {
                        max = tmp;
                        jmax = k;
                    }
                }
                if wi < max {
                    self.swap(i, jmax);
                }
            }
        }

        let mut kb: Vec<usize> = (0..nb).collect();
        kb.sort_by(|&a, &b| {
            w[self.q[b]]
                .partial_cmp(&w[self.q[a]])
                .unwrap_or(Ordering::Equal)
        });
        let mut kn: Vec<usize> = (0..nn).collect();
        kn.sort_by(|&a, &b| {
            w[self.q[nb + b]]
                .partial_cmp(&w[self.q[nb + a]])
                .unwrap_or(Ordering::Equal)
        });

        // Apply the row order kb to S and the top rows of R, the column order
        // kn to S, and both to the tracked permutation.
        let s_old = self.s.clone();
        for i in 0..nb {
            for j in 0..nn {
                self.s[(i, j)] = s_old[(kb[i], kn[j])];
            }
        }
        let r_old = self.r.clone();
        for i in 0..nb {
            for c in 0..self.m {
                self.r[(i, c)] = r_old[(kb[i], c)];
            }
        }
        let q_old = self.q.clone();
        for i in 0..nb {
            self.q[i] = q_old[kb[i]];
        }
        for j in 0..nn {
            self.q[nb + j] = q_old[nb + kn[j]];
        }
    }

    /// Apply explicit orderings to the basic and non-basic partitions.
    ///
    /// `kb` and `kn` give, for each new position, the current position of the
    /// column to place there. The canonical identity is preserved because the
    /// same permutations are applied to S, the top rows of R, and Q.
    pub fn update_ordering(&mut self, kb: &[usize], kn: &[usize]) {
        let nb = self.rank;
        let nn = self.n - nb;
        assert_eq!(kb.len(), nb, "expected {nb} basic positions, got {}", kb.len());
        assert_eq!(kn.len(), nn, "expected {nn} non-basic positions, got {}", kn.len());

        let s_old = self.s.clone();
        for i in 0..nb {
            for j in 0..nn {
                self.s[(i, j)] = s_old[(kb[i], kn[j])];
            }
        }
        let r_old = self.r.clone();
        for i in 0..nb {
            for c in 0..self.m {
                self.r[(i, c)] = r_old[(kb[i], c)];
            }
        }
        let q_old = self.q.clone();
        for i in 0..nb {
            self.q[i] = q_old[kb[i]];
        }
        for j in 0..nn {
            self.q[nb + j] = q_old[nb + kn[j]];
        }
    }

    /// Restore the form captured when `compute` last ran.
    pub fn reset(&mut self) {
        self.r.copy_from(&self.r0);
        self.s.copy_from(&self.s0);
        self.q.copy_from_slice(&self.q0);
    }

    /// Scrub residual round-off below σ·ε out of R and S.
    pub fn clean_roundoff(&mut self) {
        let sigma = self.sigma;
        if sigma == 0.0 {
            return;
        }
        self.s.apply(|v| *v = (*v + sigma) - sigma);
        self.r.apply(|v| *v = (*v + sigma) - sigma);
    }

    pub fn num_equations(&self) -> usize {
        self.m
    }

    pub fn num_variables(&self) -> usize {
        self.n
    }

    /// Rank of A, also the number of basic variables.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_non_basic(&self) -> usize {
        self.n - self.rank
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn s(&self) -> &DMatrix<f64> {
        &self.s
    }

    /// Column permutation (basic columns first).
    pub fn q(&self) -> &[usize] {
        &self.q
    }

    /// Original indices of the basic columns.
    pub fn basic_indices(&self) -> &[usize] {
        &self.q[..self.rank]
    }

    /// Original indices of the non-basic columns.
    pub fn non_basic_indices(&self) -> &[usize] {
        &self.q[self.rank..]
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Assemble the canonical matrix C = [I S] padded with zero rows.
    pub fn canonical_matrix(&self) -> DMatrix<f64> {
        let mut c = DMatrix::zeros(self.m, self.n);
        for i in 0..self.rank {
            c[(i, i)] = 1.0;
        }
        for i in 0..self.rank {
            for j in 0..self.n - self.rank {
                c[(i, self.rank + j)] = self.s[(i, j)];
            }
        }
        c
    }
}

impl Default for Echelonizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm_matrix(q: &[usize]) -> DMatrix<f64> {
        let n = q.len();
        let mut p = DMatrix::zeros(n, n);
        for (k, &orig) in q.iter().enumerate() {
            p[(orig, k)] = 1.0;
        }
        p
    }

    fn canonical_error(ech: &Echelonizer, a: &DMatrix<f64>) -> f64 {
        let raq = ech.r() * a * perm_matrix(ech.q());
        (raq - ech.canonical_matrix()).amax()
    }

    fn sample_matrix() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            3,
            5,
            &[
                2.0, 1.0, 0.0, -1.0, 3.0, //
                0.0, 4.0, 1.0, 2.0, -1.0, //
                1.0, 0.0, 2.0, 0.5, 1.0,
            ],
        )
    }

    #[test]
    fn test_compute_canonical_identity() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);
        assert_eq!(ech.rank(), 3);
        assert!(
            canonical_error(&ech, &a) < 1e-12,
            "canonical identity violated: {}",
            canonical_error(&ech, &a)
        );
    }

    #[test]
    fn test_compute_rank_deficient() {
        // Row 2 = 2 * row 0.
        let a = DMatrix::from_row_slice(3, 4, &[
            1.0, 1.0, 0.0, 2.0, //
            0.0, 1.0, 1.0, 0.0, //
            2.0, 2.0, 0.0, 4.0,
        ]);
        let mut ech = Echelonizer::new();
        ech.compute(&a);
        assert_eq!(ech.rank(), 2);
        // Top `rank` rows of R·A·Q match [I S]; the rest are zero up to σ·ε.
        let raq = ech.r() * &a * perm_matrix(ech.q());
        let c = ech.canonical_matrix();
        for i in 0..2 {
            for j in 0..4 {
                assert!((raq[(i, j)] - c[(i, j)]).abs() < 1e-12);
            }
        }
        for j in 0..4 {
            assert!(raq[(2, j)].abs() < 1e-10, "dependent row not annihilated");
        }
    }

    #[test]
    fn test_swap_preserves_identity() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);

        // Swap every basic row against the first non-basic column with a
        // usable pivot; the canonical identity must survive each exchange.
        for ib in 0..ech.rank() {
            let inb = (0..ech.num_non_basic())
                .find(|&j| ech.s()[(ib, j)].abs() > ech.threshold());
            if let Some(inb) = inb {
                ech.swap(ib, inb);
                assert!(
                    canonical_error(&ech, &a) < 1e-10,
                    "identity broken after swap({ib}, {inb})"
                );
            }
        }
    }

    #[test]
    #[should_panic(expected = "zero pivot")]
    fn test_swap_zero_pivot_panics() {
        let a = DMatrix::from_row_slice(2, 4, &[
            1.0, 0.0, 1.0, 0.0, //
            0.0, 1.0, 0.0, 1.0,
        ]);
        let mut ech = Echelonizer::new();
        ech.compute(&a);
        // Find a structurally zero S entry and pivot on it.
        let (ib, inb) = (0..ech.rank())
            .flat_map(|i| (0..ech.num_non_basic()).map(move |j| (i, j)))
            .find(|&(i, j)| ech.s()[(i, j)].abs() <= ech.threshold())
            .expect("expected a zero entry in S");
        ech.swap(ib, inb);
    }

    #[test]
    fn test_update_weights_sorts_partitions() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);

        let w = DVector::from_row_slice(&[0.5, 9.0, 3.0, 7.0, 1.0]);
        ech.update_weights(&w);

        assert!(canonical_error(&ech, &a) < 1e-10);

        let jb = ech.basic_indices();
        for pair in jb.windows(2) {
            assert!(
                w[pair[0]] >= w[pair[1]],
                "basic columns not sorted by descending weight: {:?}",
                jb
            );
        }
        let jn = ech.non_basic_indices();
        for pair in jn.windows(2) {
            assert!(
                w[pair[0]] >= w[pair[1]],
                "non-basic columns not sorted by descending weight: {:?}",
                jn
            );
        }
    }

    #[test]
    fn test_update_weights_prefers_heavy_columns_basic() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);

        // Give three columns dominating weights; they should all end up basic
        // (the matrix has full row rank and each weighted column has a usable
        // pivot in this instance).
        let w = DVector::from_row_slice(&[1e-3, 100.0, 50.0, 80.0, 1e-3]);
        ech.update_weights(&w);

        let jb = ech.basic_indices();
        for idx in [1usize, 3, 2] {
            assert!(jb.contains(&idx), "column {idx} should be basic, jb = {:?}", jb);
        }
    }

    #[test]
    fn test_update_ordering_preserves_identity() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);

        // Rotate the basic rows and swap two non-basic columns.
        ech.update_ordering(&[2, 0, 1], &[1, 0]);
        assert!(canonical_error(&ech, &a) < 1e-10);
    }

    #[test]
    fn test_reset_restores_snapshot() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);

        let r0 = ech.r().clone();
        let s0 = ech.s().clone();
        let q0 = ech.q().to_vec();

        let w = DVector::from_row_slice(&[0.5, 9.0, 3.0, 7.0, 1.0]);
        ech.update_weights(&w);
        ech.reset();

        assert_eq!(ech.q(), q0.as_slice());
        assert_eq!(ech.r(), &r0, "reset must restore R bit-identically");
        assert_eq!(ech.s(), &s0, "reset must restore S bit-identically");

        // Idempotent.
        ech.reset();
        assert_eq!(ech.r(), &r0);
    }

    #[test]
    fn test_clean_roundoff_scrubs_noise() {
        let a = sample_matrix();
        let mut ech = Echelonizer::new();
        ech.compute(&a);

        let w = DVector::from_row_slice(&[2.0, 1.0, 4.0, 3.0, 5.0]);
        ech.update_weights(&w);
        ech.clean_roundoff();
        assert!(canonical_error(&ech, &a) < 1e-10);
    }

    #[test]
    fn test_empty_constraints() {
        let a = DMatrix::zeros(0, 4);
        let mut ech = Echelonizer::new();
        ech.compute(&a);
        assert_eq!(ech.rank(), 0);
        assert_eq!(ech.num_non_basic(), 4);
    }
}
