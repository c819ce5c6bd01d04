use crate::basis_function::BasisFunction;
use crate::error::{CoregError, Result};
use crate::least_squares::LeastSquares;
use crate::numerics::NumericsContext;
use nalgebra::Matrix3;

/// A 2-D affine transformation held as a homogeneous 3×3 forward matrix
/// together with its inverse.
///
/// A point `(x, y)` maps to `(xp, yp)` by:
///
/// ```text
///   [ xp ]   [ a b c ] [ x ]
///   [ yp ] = [ d e f ] [ y ]
///   [ 1  ]   [ 0 0 1 ] [ 1 ]
/// ```
///
/// Every mutating operation updates both matrices, so `forward * inverse`
/// stays the identity to within rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    forward: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    /// The identity transform.
    ///
    /// # Examples
    /// ```
    /// # use coreg::affine::Affine;
    /// let a = Affine::identity();
    /// assert_eq!(a.compute(3.0, 4.0), (3.0, 4.0));
    /// ```
    pub fn identity() -> Self {
        Affine {
            forward: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Builds an affine from a forward matrix, computing the inverse.
    ///
    /// # Errors
    /// [`CoregError::NotInvertible`] when the matrix is singular.
    pub fn from_forward(forward: Matrix3<f64>) -> Result<Self> {
        Self::from_forward_with_context(forward, &NumericsContext::default())
    }

    pub fn from_forward_with_context(forward: Matrix3<f64>, context: &NumericsContext) -> Result<Self> {
        let inverse = invert(&forward, context)?;
        Ok(Affine { forward, inverse })
    }

    /// Builds an affine from the six parameters `[a, b, c, d, e, f]` of the
    /// two top rows.
    pub fn from_coefficients(c: [f64; 6]) -> Result<Self> {
        Self::from_forward(Matrix3::new(c[0], c[1], c[2], c[3], c[4], c[5], 0.0, 0.0, 1.0))
    }

    /// Fits the transform mapping `(x[i], y[i])` onto `(xp[i], yp[i])`.
    ///
    /// Two degree-1 least-squares fits are solved, one per output axis, so at
    /// least three non-collinear points are needed.
    ///
    /// # Errors
    /// - [`CoregError::InvalidArgument`] when the slices differ in length.
    /// - [`CoregError::Underdetermined`] when fewer than three usable points are given.
    /// - [`CoregError::NotInvertible`] when the fitted matrix is singular.
    ///
    /// # Examples
    /// ```
    /// # use coreg::affine::Affine;
    /// let a = Affine::solve(
    ///     &[0.0, 1.0, 0.0],
    ///     &[0.0, 0.0, 1.0],
    ///     &[2.0, 3.0, 2.0],
    ///     &[3.0, 3.0, 4.0],
    /// )
    /// .unwrap();
    /// let (x, y) = a.compute_inverse(3.0, 3.0);
    /// assert!((x - 1.0).abs() < 1e-12 && y.abs() < 1e-12);
    /// ```
    pub fn solve(x: &[f64], y: &[f64], xp: &[f64], yp: &[f64]) -> Result<Self> {
        Self::solve_with_context(x, y, xp, yp, &NumericsContext::default())
    }

    pub fn solve_with_context(
        x: &[f64],
        y: &[f64],
        xp: &[f64],
        yp: &[f64],
        context: &NumericsContext,
    ) -> Result<Self> {
        let n = x.len();
        if y.len() != n || xp.len() != n || yp.len() != n {
            return Err(CoregError::InvalidArgument(
                "affine solve needs equally sized coordinate slices".to_string(),
            ));
        }

        let mut fit_x = LeastSquares::with_context(BasisFunction::affine(), *context);
        let mut fit_y = LeastSquares::with_context(BasisFunction::affine(), *context);
        for i in 0..n {
            fit_x.add_known(&[x[i], y[i]], xp[i], 1.0);
            fit_y.add_known(&[x[i], y[i]], yp[i], 1.0);
        }
        fit_x.solve()?;
        fit_y.solve()?;

        // Coefficients are ordered {1, x, y}.
        let cx = fit_x.basis().coefficients();
        let cy = fit_y.basis().coefficients();
        let forward = Matrix3::new(cx[1], cx[2], cx[0], cy[1], cy[2], cy[0], 0.0, 0.0, 1.0);
        Self::from_forward_with_context(forward, context)
    }

    /// Pre-multiplies by a translation: `A ← T(tx, ty)·A`.
    ///
    /// # Examples
    /// ```
    /// # use coreg::affine::Affine;
    /// let mut a = Affine::identity();
    /// a.translate(2.0, -1.0);
    /// assert_eq!(a.compute(1.0, 1.0), (3.0, 0.0));
    /// assert_eq!(a.compute_inverse(3.0, 0.0), (1.0, 1.0));
    /// ```
    pub fn translate(&mut self, tx: f64, ty: f64) {
        self.forward = translation(tx, ty) * self.forward;
        self.inverse *= translation(-tx, -ty);
    }

    /// Pre-multiplies by a counter-clockwise rotation of `degrees`.
    pub fn rotate(&mut self, degrees: f64) {
        self.forward = rotation(degrees) * self.forward;
        self.inverse *= rotation(-degrees);
    }

    /// Pre-multiplies by an isotropic scale.
    ///
    /// # Errors
    /// [`CoregError::NotInvertible`] for a zero scale; the transform is left
    /// unchanged.
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        if factor == 0.0 || !factor.is_finite() {
            return Err(CoregError::NotInvertible);
        }
        self.forward = scaling(factor) * self.forward;
        self.inverse *= scaling(1.0 / factor);
        Ok(())
    }

    /// Applies `other` after `self`, i.e. `A ← other·A`.
    pub fn then(&self, other: &Affine) -> Affine {
        Affine {
            forward: other.forward * self.forward,
            inverse: self.inverse * other.inverse,
        }
    }

    pub fn forward(&self) -> &Matrix3<f64> {
        &self.forward
    }

    pub fn inverse(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    /// The six parameters `[a, b, c, d, e, f]` of the forward matrix.
    pub fn coefficients(&self) -> [f64; 6] {
        let m = &self.forward;
        [m[(0, 0)], m[(0, 1)], m[(0, 2)], m[(1, 0)], m[(1, 1)], m[(1, 2)]]
    }

    /// Maps `(x, y)` through the forward matrix.
    pub fn compute(&self, x: f64, y: f64) -> (f64, f64) {
        apply(&self.forward, x, y)
    }

    /// Maps `(xp, yp)` through the inverse matrix.
    pub fn compute_inverse(&self, xp: f64, yp: f64) -> (f64, f64) {
        apply(&self.inverse, xp, yp)
    }

    /// Lengths of the two rows of the 2×2 linear part, the per-axis scale
    /// of the transform.
    pub fn scale_factors(&self) -> (f64, f64) {
        let m = &self.forward;
        (
            m[(0, 0)].hypot(m[(0, 1)]),
            m[(1, 0)].hypot(m[(1, 1)]),
        )
    }

    /// Checks that both scale factors lie strictly inside
    /// `[1/scale_bound, scale_bound]`. Non-positive bounds are rejected.
    pub fn is_scale_valid(&self, scale_bound: f64) -> bool {
        if scale_bound <= 0.0 {
            return false;
        }
        let min_scale = 1.0 / scale_bound;
        let (sx, sy) = self.scale_factors();
        sx > min_scale && sx < scale_bound && sy > min_scale && sy < scale_bound
    }
}

fn apply(m: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    (
        m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)],
        m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)],
    )
}

fn translation(tx: f64, ty: f64) -> Matrix3<f64> {
    Matrix3::new(1.0, 0.0, tx, 0.0, 1.0, ty, 0.0, 0.0, 1.0)
}

fn rotation(degrees: f64) -> Matrix3<f64> {
    let (s, c) = degrees.to_radians().sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

fn scaling(factor: f64) -> Matrix3<f64> {
    Matrix3::new(factor, 0.0, 0.0, 0.0, factor, 0.0, 0.0, 0.0, 1.0)
}

/// Inverts through the SVD `M = U Σ Vᵀ` as `V Σ⁻¹ Uᵀ`.
fn invert(m: &Matrix3<f64>, context: &NumericsContext) -> Result<Matrix3<f64>> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(CoregError::NotInvertible);
    }
    let svd = (*m).svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(CoregError::NotInvertible),
    };
    let max_singular = svd.singular_values.max();
    let threshold = context.singular_tolerance * max_singular;
    if max_singular <= 0.0 || svd.singular_values.iter().any(|s| *s <= threshold) {
        return Err(CoregError::NotInvertible);
    }
    let inv_s = Matrix3::from_diagonal(&svd.singular_values.map(|s| 1.0 / s));
    Ok(v_t.transpose() * inv_s * u.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assert_matrix_eq(a: &Matrix3<f64>, b: &Matrix3<f64>, epsilon: f64) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = epsilon);
        }
    }

    #[test]
    fn three_point_fit() {
        let a = Affine::solve(
            &[0.0, 1.0, 0.0],
            &[0.0, 0.0, 1.0],
            &[2.0, 3.0, 2.0],
            &[3.0, 3.0, 4.0],
        )
        .unwrap();
        let expected = Matrix3::new(1.0, 0.0, 2.0, 0.0, 1.0, 3.0, 0.0, 0.0, 1.0);
        let expected_inverse = Matrix3::new(1.0, 0.0, -2.0, 0.0, 1.0, -3.0, 0.0, 0.0, 1.0);
        assert_matrix_eq(a.forward(), &expected, 1e-12);
        assert_matrix_eq(a.inverse(), &expected_inverse, 1e-12);
        assert_matrix_eq(&(a.forward() * a.inverse()), &Matrix3::identity(), 1e-12);
    }

    #[test]
    fn solve_round_trips_control_points() {
        let x = [10.0, 250.0, 40.0];
        let y = [5.0, 30.0, 410.0];
        let xp = [13.5, 252.0, 60.25];
        let yp = [-2.0, 40.0, 390.0];
        let a = Affine::solve(&x, &y, &xp, &yp).unwrap();
        for i in 0..3 {
            let (sx, sy) = a.compute_inverse(xp[i], yp[i]);
            assert_abs_diff_eq!(sx, x[i], epsilon = 1e-9);
            assert_abs_diff_eq!(sy, y[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn forward_and_inverse_are_consistent() {
        let mut a = Affine::identity();
        a.rotate(33.0);
        a.scale(1.7).unwrap();
        a.translate(-12.0, 4.5);
        for (x, y) in [(0.0, 0.0), (123.0, -45.0), (1e3, 2e3)] {
            let (xp, yp) = a.compute(x, y);
            let (bx, by) = a.compute_inverse(xp, yp);
            assert_abs_diff_eq!(bx, x, epsilon = 1e-9);
            assert_abs_diff_eq!(by, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn translate_back_restores_state() {
        let mut a = Affine::solve(
            &[0.0, 4.0, 1.0],
            &[0.0, 1.0, 3.0],
            &[1.0, 5.5, 1.5],
            &[2.0, 2.5, 5.0],
        )
        .unwrap();
        let before = a;
        a.translate(7.25, -3.5);
        a.translate(-7.25, 3.5);
        assert_matrix_eq(a.forward(), before.forward(), 1e-12);
        assert_matrix_eq(a.inverse(), before.inverse(), 1e-12);
    }

    #[test]
    fn rotation_is_counter_clockwise_degrees() {
        let mut a = Affine::identity();
        a.rotate(90.0);
        let (x, y) = a.compute(1.0, 0.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn identity_is_idempotent() {
        let a = Affine::identity().then(&Affine::identity());
        assert_eq!(a, Affine::identity());
    }

    #[test]
    fn singular_matrices_are_rejected() {
        let singular = Matrix3::new(1.0, 2.0, 0.0, 2.0, 4.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(Affine::from_forward(singular), Err(CoregError::NotInvertible));

        let mut a = Affine::identity();
        assert_eq!(a.scale(0.0), Err(CoregError::NotInvertible));
        assert_eq!(a, Affine::identity());
    }

    #[test]
    fn scale_validity() {
        let mut a = Affine::identity();
        assert!(a.is_scale_valid(2.0));
        assert!(!a.is_scale_valid(0.0));
        a.scale(3.0).unwrap();
        assert!(!a.is_scale_valid(2.0));
    }
}
