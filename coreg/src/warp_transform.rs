use crate::basis_function::BasisFunction;
use crate::error::{CoregError, Result};
use crate::least_squares::LeastSquares;
use crate::tie_point::TiePoint;
use parking_lot::Mutex;

/// Distance below which a control point gets unit weight in weighted mode.
const MIN_WEIGHT_DISTANCE: f64 = 1e-3;

/// A pair of least-squares fits, one per input axis.
#[derive(Debug, Clone)]
struct AxisFits {
    line: LeastSquares,
    sample: LeastSquares,
}

impl AxisFits {
    fn evaluate(&self, vars: &[f64; 2]) -> (f64, f64) {
        (self.sample.evaluate(vars), self.line.evaluate(vars))
    }
}

#[derive(Debug)]
enum Fits {
    Fixed(AxisFits),
    /// Re-solved for every query, so access goes through the lock.
    Weighted {
        fits: Mutex<AxisFits>,
        out_sample: Vec<f64>,
        out_line: Vec<f64>,
    },
}

/// Polynomial inverse mapping from output `(sample, line)` to input
/// `(sample, line)`, fitted to control points.
///
/// The basis variables are `[out_line, out_sample]`. Unweighted queries are
/// pure evaluations of coefficients solved once at construction. In weighted
/// mode every query re-weights the control points by the inverse of their
/// distance to the query and re-solves, which serialises concurrent queries.
#[derive(Debug)]
pub struct WarpTransform {
    fits: Fits,
    input_samples: usize,
    input_lines: usize,
    output_samples: usize,
    output_lines: usize,
}

impl WarpTransform {
    /// Fits the transform to `points` (every record is used, including ones
    /// flagged as ignored).
    ///
    /// # Parameters
    /// - `line_basis`, `sample_basis`: bases fitted to the input line and input sample.
    /// - `weighted`: enables per-query inverse-distance weighting.
    /// - `input_dims`, `output_dims`: `(samples, lines)` of the two rasters.
    ///
    /// # Errors
    /// [`CoregError::Underdetermined`] when there are too few (or degenerate)
    /// points for either basis.
    ///
    /// # Examples
    /// ```
    /// # use coreg::basis_function::BasisFunction;
    /// # use coreg::tie_point::TiePoint;
    /// # use coreg::warp_transform::WarpTransform;
    /// let points = [
    ///     TiePoint::new(1.0, 1.0, 2.0, 1.0),
    ///     TiePoint::new(4.0, 1.0, 5.0, 1.0),
    ///     TiePoint::new(1.0, 4.0, 2.0, 4.0),
    /// ];
    /// let warp = WarpTransform::new(
    ///     BasisFunction::affine(),
    ///     BasisFunction::affine(),
    ///     false,
    ///     &points,
    ///     (4, 4),
    ///     (5, 4),
    /// )
    /// .unwrap();
    /// let (s, l) = warp.inverse_map(3.0, 2.0).unwrap();
    /// assert!((s - 2.0).abs() < 1e-9 && (l - 2.0).abs() < 1e-9);
    /// ```
    pub fn new(
        line_basis: BasisFunction,
        sample_basis: BasisFunction,
        weighted: bool,
        points: &[TiePoint],
        input_dims: (usize, usize),
        output_dims: (usize, usize),
    ) -> Result<Self> {
        let mut line = LeastSquares::new(line_basis);
        let mut sample = LeastSquares::new(sample_basis);
        for p in points {
            let vars = [p.out_line, p.out_sample];
            line.add_known(&vars, p.in_line, 1.0);
            sample.add_known(&vars, p.in_sample, 1.0);
        }
        line.solve()?;
        sample.solve()?;

        let fits = AxisFits { line, sample };
        let fits = if weighted {
            Fits::Weighted {
                fits: Mutex::new(fits),
                out_sample: points.iter().map(|p| p.out_sample).collect(),
                out_line: points.iter().map(|p| p.out_line).collect(),
            }
        } else {
            Fits::Fixed(fits)
        };

        Ok(WarpTransform {
            fits,
            input_samples: input_dims.0,
            input_lines: input_dims.1,
            output_samples: output_dims.0,
            output_lines: output_dims.1,
        })
    }

    pub fn is_weighted(&self) -> bool {
        matches!(self.fits, Fits::Weighted { .. })
    }

    /// Maps an output coordinate to `(in_sample, in_line)`.
    ///
    /// Queries outside the output raster are answered like any other. Returns
    /// `None` only when a weighted re-solve fails.
    pub fn inverse_map(&self, out_sample: f64, out_line: f64) -> Option<(f64, f64)> {
        let vars = [out_line, out_sample];
        match &self.fits {
            Fits::Fixed(fits) => Some(fits.evaluate(&vars)),
            Fits::Weighted {
                fits,
                out_sample: control_sample,
                out_line: control_line,
            } => {
                let mut fits = fits.lock();
                for (i, (cs, cl)) in control_sample.iter().zip(control_line).enumerate() {
                    let distance = (out_sample - cs).hypot(out_line - cl);
                    let weight = if distance >= MIN_WEIGHT_DISTANCE {
                        1.0 / distance
                    } else {
                        1.0
                    };
                    fits.line.reweight(i, weight);
                    fits.sample.reweight(i, weight);
                }
                fits.line.solve().ok()?;
                fits.sample.solve().ok()?;
                Some(fits.evaluate(&vars))
            }
        }
    }

    /// Per-point `(line_residual, sample_residual)` from the last solve, in
    /// the order the points were given.
    pub fn residuals(&self) -> Vec<(f64, f64)> {
        let collect = |fits: &AxisFits| -> Vec<(f64, f64)> {
            fits.line
                .residuals()
                .iter()
                .zip(fits.sample.residuals())
                .map(|(l, s)| (*l, *s))
                .collect()
        };
        match &self.fits {
            Fits::Fixed(fits) => collect(fits),
            Fits::Weighted { fits, .. } => collect(&fits.lock()),
        }
    }

    /// Coefficients of the `(line, sample)` fits from the last solve.
    pub fn coefficients(&self) -> (Vec<f64>, Vec<f64>) {
        let collect = |fits: &AxisFits| {
            (
                fits.line.basis().coefficients().to_vec(),
                fits.sample.basis().coefficients().to_vec(),
            )
        };
        match &self.fits {
            Fits::Fixed(fits) => collect(fits),
            Fits::Weighted { fits, .. } => collect(&fits.lock()),
        }
    }

    pub fn input_samples(&self) -> usize {
        self.input_samples
    }

    pub fn input_lines(&self) -> usize {
        self.input_lines
    }

    pub fn output_samples(&self) -> usize {
        self.output_samples
    }

    pub fn output_lines(&self) -> usize {
        self.output_lines
    }
}

/// Builds the two polynomial bases of `degree` and fits a [`WarpTransform`].
pub fn fit_polynomial_warp(
    degree: usize,
    weighted: bool,
    points: &[TiePoint],
    input_dims: (usize, usize),
    output_dims: (usize, usize),
) -> Result<WarpTransform> {
    if points.is_empty() {
        return Err(CoregError::Empty);
    }
    WarpTransform::new(
        BasisFunction::polynomial(degree),
        BasisFunction::polynomial(degree),
        weighted,
        points,
        input_dims,
        output_dims,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// A smooth quadratic distortion from output to input.
    fn distort(s: f64, l: f64) -> (f64, f64) {
        (
            0.5 + 1.01 * s - 0.02 * l + 1e-3 * s * l,
            -1.5 + 0.03 * s + 0.98 * l + 2e-4 * s * s,
        )
    }

    fn grid_points(n: usize, spacing: f64) -> Vec<TiePoint> {
        let mut points = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let (os, ol) = (1.0 + i as f64 * spacing, 1.0 + j as f64 * spacing);
                let (is, il) = distort(os, ol);
                points.push(TiePoint::new(is, il, os, ol));
            }
        }
        points
    }

    #[test]
    fn exact_fit_has_zero_residuals() {
        // Six points for six quadratic coefficients.
        let coords = [(1.0, 1.0), (50.0, 3.0), (7.0, 60.0), (44.0, 41.0), (25.0, 12.0), (13.0, 33.0)];
        let points: Vec<TiePoint> = coords
            .iter()
            .map(|&(os, ol)| TiePoint::new(os * 0.7 + 2.0, ol * 1.3 - 1.0 + os * 0.1, os, ol))
            .collect();
        let warp = fit_polynomial_warp(2, false, &points, (100, 100), (64, 64)).unwrap();
        let residuals = warp.residuals();
        assert_eq!(residuals.len(), 6);
        for (rl, rs) in residuals {
            assert_abs_diff_eq!(rl, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(rs, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn unweighted_answers_outside_output_bounds() {
        let points = grid_points(4, 20.0);
        let warp = fit_polynomial_warp(2, false, &points, (80, 80), (61, 61)).unwrap();
        let (s, l) = warp.inverse_map(-30.0, 200.0).unwrap();
        let (es, el) = distort(-30.0, 200.0);
        assert_abs_diff_eq!(s, es, epsilon = 1e-6);
        assert_abs_diff_eq!(l, el, epsilon = 1e-6);
    }

    #[test]
    fn weighted_round_trips_control_points() {
        let points = grid_points(4, 20.0);
        let warp = fit_polynomial_warp(2, true, &points, (80, 80), (61, 61)).unwrap();
        assert!(warp.is_weighted());
        for p in &points {
            let (s, l) = warp.inverse_map(p.out_sample, p.out_line).unwrap();
            assert_abs_diff_eq!(s, p.in_sample, epsilon = 1e-6);
            assert_abs_diff_eq!(l, p.in_line, epsilon = 1e-6);
        }
        assert_eq!(warp.residuals().len(), points.len());
    }

    #[test]
    fn weighted_mode_favours_nearby_points() {
        // Three consistent corners and one displaced point: near the displaced
        // point the weighted fit follows it more closely than the global fit.
        let mut points = vec![
            TiePoint::new(1.0, 1.0, 1.0, 1.0),
            TiePoint::new(100.0, 1.0, 100.0, 1.0),
            TiePoint::new(1.0, 100.0, 1.0, 100.0),
            TiePoint::new(110.0, 110.0, 100.0, 100.0),
        ];
        points.push(TiePoint::new(50.0, 50.0, 50.0, 50.0));
        let plain = fit_polynomial_warp(1, false, &points, (120, 120), (100, 100)).unwrap();
        let weighted = fit_polynomial_warp(1, true, &points, (120, 120), (100, 100)).unwrap();
        let (ps, _) = plain.inverse_map(99.0, 99.0).unwrap();
        let (ws, _) = weighted.inverse_map(99.0, 99.0).unwrap();
        assert!((ws - 109.0).abs() < (ps - 109.0).abs());
    }

    /// A 4×4 grid on an affine map, with a fixed pattern of sub-pixel noise
    /// that no single affine reproduces.
    fn noisy_points() -> Vec<TiePoint> {
        let mut points = Vec::new();
        for j in 0..4 {
            for i in 0..4 {
                let (os, ol) = (1.0 + i as f64 * 20.0, 1.0 + j as f64 * 20.0);
                let noise = ((i * 7 + j * 3) % 5) as f64 * 0.2 - 0.4;
                let (is, il) = (2.0 + 1.01 * os - 0.02 * ol + noise, -1.0 + 0.03 * os + 0.99 * ol - noise);
                points.push(TiePoint::new(is, il, os, ol));
            }
        }
        points
    }

    /// Solves the weighted fit at `(sample, line)` directly from the weight rule.
    fn solve_at(points: &[TiePoint], sample: f64, line: f64) -> (f64, f64) {
        let mut fit_line = LeastSquares::new(BasisFunction::polynomial(1));
        let mut fit_sample = LeastSquares::new(BasisFunction::polynomial(1));
        for p in points {
            let d = (sample - p.out_sample).hypot(line - p.out_line);
            let weight = if d < 1e-3 { 1.0 } else { 1.0 / d };
            fit_line.add_known(&[p.out_line, p.out_sample], p.in_line, weight);
            fit_sample.add_known(&[p.out_line, p.out_sample], p.in_sample, weight);
        }
        fit_line.solve().unwrap();
        fit_sample.solve().unwrap();
        (fit_sample.evaluate(&[line, sample]), fit_line.evaluate(&[line, sample]))
    }

    #[test]
    fn weighted_mode_tracks_noisy_control_points() {
        let mut points = noisy_points();
        points[5].in_sample += 3.0;
        points[5].in_line -= 2.0;
        let plain = fit_polynomial_warp(1, false, &points, (100, 100), (61, 61)).unwrap();
        let weighted = fit_polynomial_warp(1, true, &points, (100, 100), (61, 61)).unwrap();

        let miss = |warp: &WarpTransform, p: &TiePoint| {
            let (s, l) = warp.inverse_map(p.out_sample, p.out_line).unwrap();
            (s - p.in_sample).hypot(l - p.in_line)
        };
        assert!(miss(&weighted, &points[5]) < 0.5 * miss(&plain, &points[5]));

        let total = |warp: &WarpTransform| points.iter().map(|p| miss(warp, p).powi(2)).sum::<f64>();
        assert!(total(&weighted) < total(&plain));
    }

    #[test]
    fn coincident_control_point_gets_unit_weight() {
        let points = noisy_points();
        let weighted = fit_polynomial_warp(1, true, &points, (100, 100), (61, 61)).unwrap();
        for (s, l) in [(21.0, 41.0), (21.0004, 40.9997), (30.0, 35.0)] {
            let (ws, wl) = weighted.inverse_map(s, l).unwrap();
            let (es, el) = solve_at(&points, s, l);
            assert_abs_diff_eq!(ws, es, epsilon = 1e-9);
            assert_abs_diff_eq!(wl, el, epsilon = 1e-9);
        }
    }

    #[test]
    fn too_few_points() {
        let points = grid_points(2, 10.0);
        assert!(matches!(
            fit_polynomial_warp(2, false, &points, (20, 20), (20, 20)),
            Err(CoregError::Underdetermined { .. })
        ));
        assert!(matches!(
            fit_polynomial_warp(1, false, &[], (20, 20), (20, 20)),
            Err(CoregError::Empty)
        ));
    }
}
