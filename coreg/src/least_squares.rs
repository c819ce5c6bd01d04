use crate::basis_function::BasisFunction;
use crate::error::{CoregError, Result};
use crate::numerics::NumericsContext;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Decomposition used by [`LeastSquares::solve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolveMethod {
    /// Singular value decomposition pseudo-inverse. Tolerates rank deficiency
    /// up to the rank check.
    #[default]
    Svd,
    /// Householder QR followed by back substitution. Requires full column rank.
    Qrd,
}

/// A weighted linear least-squares problem over a [`BasisFunction`].
///
/// Rows are `(terms, known, weight)`. The expanded terms are buffered when a
/// row is added, so re-weighting only rebuilds the weighted design matrix.
/// Zero-weight rows take no part in the fit but keep their index and still
/// receive a residual.
///
/// # Examples
/// ```
/// # use coreg::basis_function::BasisFunction;
/// # use coreg::least_squares::LeastSquares;
/// let mut lsq = LeastSquares::new(BasisFunction::affine());
/// lsq.add_known(&[0.0, 0.0], 1.0, 1.0);
/// lsq.add_known(&[1.0, 0.0], 3.0, 1.0);
/// lsq.add_known(&[0.0, 1.0], 4.0, 1.0);
/// lsq.solve().unwrap();
/// assert!((lsq.evaluate(&[1.0, 1.0]) - 6.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct LeastSquares {
    basis: BasisFunction,
    context: NumericsContext,
    method: SolveMethod,
    inputs: Vec<Vec<f64>>,
    terms: Vec<Vec<f64>>,
    knowns: Vec<f64>,
    sqrt_weights: Vec<f64>,
    residuals: Vec<f64>,
    sigma0: f64,
    degrees_of_freedom: isize,
    solved: bool,
}

impl LeastSquares {
    pub fn new(basis: BasisFunction) -> Self {
        Self::with_context(basis, NumericsContext::default())
    }

    pub fn with_context(basis: BasisFunction, context: NumericsContext) -> Self {
        LeastSquares {
            basis,
            context,
            method: SolveMethod::default(),
            inputs: Vec::new(),
            terms: Vec::new(),
            knowns: Vec::new(),
            sqrt_weights: Vec::new(),
            residuals: Vec::new(),
            sigma0: 0.0,
            degrees_of_freedom: 0,
            solved: false,
        }
    }

    /// Selects the decomposition used by subsequent solves.
    pub fn set_method(&mut self, method: SolveMethod) {
        self.method = method;
    }

    /// Appends a row. `weight` must be non-negative.
    pub fn add_known(&mut self, vars: &[f64], known: f64, weight: f64) {
        assert!(weight >= 0.0, "least-squares weights must be non-negative");
        self.terms.push(self.basis.expand(vars));
        self.inputs.push(vars.to_vec());
        self.knowns.push(known);
        self.sqrt_weights.push(weight.sqrt());
        self.solved = false;
    }

    /// Changes the weight of row `row`. The residuals and coefficients are
    /// stale until the next [`solve`](Self::solve).
    ///
    /// # Panics
    /// Panics on a negative weight or an out-of-range `row`.
    pub fn reweight(&mut self, row: usize, weight: f64) {
        assert!(weight >= 0.0, "least-squares weights must be non-negative");
        self.sqrt_weights[row] = if weight == 1.0 { 1.0 } else { weight.sqrt() };
        self.solved = false;
    }

    pub fn weight(&self, row: usize) -> f64 {
        self.sqrt_weights[row] * self.sqrt_weights[row]
    }

    pub fn rows(&self) -> usize {
        self.knowns.len()
    }

    /// Variables passed to [`add_known`](Self::add_known) for `row`.
    pub fn input(&self, row: usize) -> &[f64] {
        &self.inputs[row]
    }

    pub fn known(&self, row: usize) -> f64 {
        self.knowns[row]
    }

    pub fn knowns(&self) -> &[f64] {
        &self.knowns
    }

    /// Drops every row and the current solution. The basis coefficients are
    /// left as they were.
    pub fn reset(&mut self) {
        self.inputs.clear();
        self.terms.clear();
        self.knowns.clear();
        self.sqrt_weights.clear();
        self.residuals.clear();
        self.sigma0 = 0.0;
        self.degrees_of_freedom = 0;
        self.solved = false;
    }

    /// Solves for the basis coefficients minimising `Σ w (τ·c − y)²`.
    ///
    /// Fails with [`CoregError::Underdetermined`] when fewer rows carry weight
    /// than there are coefficients, or when the weighted design matrix is
    /// rank deficient.
    pub fn solve(&mut self) -> Result<()> {
        self.solved = false;
        self.residuals.clear();

        let n = self.basis.terms();
        let usable = self.sqrt_weights.iter().filter(|w| **w > 0.0).count();
        if usable < n {
            return Err(CoregError::Underdetermined {
                rows: usable,
                coefficients: n,
            });
        }

        let a = DMatrix::from_fn(self.rows(), n, |r, c| self.terms[r][c] * self.sqrt_weights[r]);
        let b = DVector::from_fn(self.rows(), |r, _| self.knowns[r] * self.sqrt_weights[r]);

        let coefficients = match self.method {
            SolveMethod::Svd => self.solve_svd(a, &b)?,
            SolveMethod::Qrd => self.solve_qrd(a, &b)?,
        };
        self.basis.set_coefficients(coefficients.as_slice());

        let mut weighted_sum = 0.0;
        for row in 0..self.rows() {
            let residual = self.basis.evaluate(&self.inputs[row]) - self.knowns[row];
            weighted_sum += residual * residual * self.weight(row);
            self.residuals.push(residual);
        }
        self.degrees_of_freedom = usable as isize - n as isize;
        self.sigma0 = if self.degrees_of_freedom > 0 {
            (weighted_sum / self.degrees_of_freedom as f64).sqrt()
        } else {
            weighted_sum.sqrt()
        };
        self.solved = true;
        Ok(())
    }

    fn solve_svd(&self, a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let n = a.ncols();
        let svd = a.svd(true, true);
        let max_singular = svd.singular_values.max();
        let eps = self.context.rank_tolerance * max_singular;
        let rank = svd.singular_values.iter().filter(|s| **s > eps).count();
        if rank < n || max_singular <= 0.0 {
            return Err(CoregError::Underdetermined {
                rows: rank,
                coefficients: n,
            });
        }
        svd.solve(b, eps).map_err(|_| CoregError::Underdetermined {
            rows: rank,
            coefficients: n,
        })
    }

    fn solve_qrd(&self, a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let n = a.ncols();
        let qr = a.qr();
        let r = qr.r();
        let max_diagonal = r.diagonal().iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let rank = r
            .diagonal()
            .iter()
            .filter(|v| v.abs() > self.context.rank_tolerance * max_diagonal)
            .count();
        let underdetermined = CoregError::Underdetermined {
            rows: rank,
            coefficients: n,
        };
        if rank < n {
            return Err(underdetermined);
        }
        let qtb = qr.q().transpose() * b;
        r.solve_upper_triangular(&qtb).ok_or(underdetermined)
    }

    pub fn is_solved(&self) -> bool {
        self.solved
    }

    /// Evaluates the fitted basis at `vars`.
    pub fn evaluate(&self, vars: &[f64]) -> f64 {
        self.basis.evaluate(vars)
    }

    /// Residual `τ_k·c − y_k` of row `k` from the last solve.
    ///
    /// # Panics
    /// Panics if the problem has not been solved since the last change, or if
    /// `row` is out of range.
    pub fn residual(&self, row: usize) -> f64 {
        assert!(self.solved, "residuals are only available after a solve");
        self.residuals[row]
    }

    /// Residuals from the last solve, or an empty slice when stale.
    pub fn residuals(&self) -> &[f64] {
        if self.solved {
            &self.residuals
        } else {
            &[]
        }
    }

    pub fn sigma0(&self) -> f64 {
        self.sigma0
    }

    pub fn degrees_of_freedom(&self) -> isize {
        self.degrees_of_freedom
    }

    pub fn basis(&self) -> &BasisFunction {
        &self.basis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    #[should_panic(expected = "only available after a solve")]
    fn residual_before_solve_panics() {
        corner_problem().residual(0);
    }

    fn corner_problem() -> LeastSquares {
        let mut lsq = LeastSquares::new(BasisFunction::affine());
        for (x, y) in [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)] {
            lsq.add_known(&[x, y], 3.0 + x + 2.0 * y, 1.0);
        }
        lsq
    }

    #[test]
    fn zero_weight_outlier_then_reweighted() {
        let mut lsq = corner_problem();
        lsq.add_known(&[5.0, 5.0], 100.0, 0.0);
        lsq.solve().unwrap();
        for row in 0..4 {
            assert_abs_diff_eq!(lsq.residual(row), 0.0, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(lsq.basis().coefficient(0), 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(lsq.basis().coefficient(1), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(lsq.basis().coefficient(2), 2.0, epsilon = 1e-9);
        assert!(lsq.residual(4).abs() > 1.0);

        lsq.reweight(4, 1.0);
        assert!(lsq.residuals().is_empty());
        lsq.solve().unwrap();
        assert_eq!(lsq.residuals().len(), 5);
        for row in 0..5 {
            assert!(lsq.residual(row).abs() > 1e-6, "row {row}");
        }
    }

    #[test]
    fn underdetermined_when_too_few_rows() {
        let mut lsq = LeastSquares::new(BasisFunction::polynomial(2));
        for x in 0..5 {
            lsq.add_known(&[x as f64, 1.0], 1.0, 1.0);
        }
        assert!(matches!(
            lsq.solve(),
            Err(CoregError::Underdetermined { coefficients: 6, .. })
        ));

        let mut empty = LeastSquares::new(BasisFunction::affine());
        assert_eq!(
            empty.solve(),
            Err(CoregError::Underdetermined { rows: 0, coefficients: 3 })
        );
    }

    #[test]
    fn collinear_rows_are_underdetermined() {
        let mut lsq = LeastSquares::new(BasisFunction::affine());
        for t in 0..6 {
            let t = t as f64;
            lsq.add_known(&[t, 2.0 * t], t, 1.0);
        }
        assert!(matches!(lsq.solve(), Err(CoregError::Underdetermined { .. })));
    }

    #[test]
    fn solve_is_idempotent() {
        let mut lsq = corner_problem();
        lsq.add_known(&[3.0, 7.0], 20.0, 2.0);
        lsq.solve().unwrap();
        let first = lsq.basis().coefficients().to_vec();
        lsq.solve().unwrap();
        assert_eq!(first, lsq.basis().coefficients());
    }

    #[test]
    fn qrd_matches_svd() {
        let mut svd = corner_problem();
        svd.add_known(&[4.0, 6.0], 18.5, 1.0);
        let mut qrd = svd.clone();
        qrd.set_method(SolveMethod::Qrd);
        svd.solve().unwrap();
        qrd.solve().unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(
                svd.basis().coefficient(i),
                qrd.basis().coefficient(i),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn sigma0_and_reset() {
        let mut lsq = corner_problem();
        lsq.add_known(&[5.0, 5.0], 21.0, 1.0);
        lsq.solve().unwrap();
        assert_eq!(lsq.degrees_of_freedom(), 2);
        let sum: f64 = lsq.residuals().iter().map(|r| r * r).sum();
        assert_abs_diff_eq!(lsq.sigma0(), (sum / 2.0).sqrt(), epsilon = 1e-12);
        assert_eq!(lsq.input(4), &[5.0, 5.0]);

        lsq.reset();
        assert_eq!(lsq.rows(), 0);
        assert!(!lsq.is_solved());
    }
}
