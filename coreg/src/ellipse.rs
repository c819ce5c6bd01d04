//! Ellipses in chip coordinates and algebraic conic fitting.

use crate::error::{CoregError, Result};
use nalgebra::{DMatrix, Matrix2, SymmetricEigen};

/// Bisection steps used by [`Ellipse::distance`]; enough to exhaust `f64`.
const MAX_ROOT_ITERATIONS: usize = 1074;

/// An ellipse given by its centre, semi-axes `a ≥ b > 0` and the direction
/// of the major axis.
///
/// Points `p` on the ellipse satisfy `(p - c)ᵀ M (p - c) = 1` where `M` is the
/// symmetric matrix returned (in coefficient form) by
/// [`quadratic`](Self::quadratic).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    center: (f64, f64),
    semi_major: f64,
    semi_minor: f64,
    /// Unit vector along the major axis.
    major_axis: (f64, f64),
}

impl Ellipse {
    /// Builds an ellipse from its centre, semi-axes and the angle (radians,
    /// counter-clockwise from +sample) of the first axis. The axes are
    /// swapped when `a < b` so the major axis is always the longer one.
    ///
    /// # Errors
    /// [`CoregError::InvalidArgument`] for non-positive or non-finite axes.
    ///
    /// # Examples
    /// ```
    /// # use coreg::ellipse::Ellipse;
    /// let e = Ellipse::new((10.0, 10.0), 2.0, 4.0, 0.0).unwrap();
    /// assert_eq!((e.semi_major(), e.semi_minor()), (4.0, 2.0));
    /// assert!(e.major_axis().0.abs() < 1e-12);
    /// ```
    pub fn new(center: (f64, f64), a: f64, b: f64, angle: f64) -> Result<Self> {
        if !a.is_finite() || !b.is_finite() || a <= 0.0 || b <= 0.0 {
            return Err(CoregError::InvalidArgument(format!(
                "ellipse semi-axes must be positive, got {a} and {b}"
            )));
        }
        let (angle, a, b) = if a < b {
            (angle + std::f64::consts::FRAC_PI_2, b, a)
        } else {
            (angle, a, b)
        };
        let (sin, cos) = angle.sin_cos();
        Ok(Ellipse {
            center,
            semi_major: a,
            semi_minor: b,
            major_axis: (cos, sin),
        })
    }

    /// Builds the ellipse `(p - c)ᵀ M (p - c) = 1` with
    /// `M = [[m[0], m[1]], [m[1], m[2]]]`. Returns `None` unless `M` is
    /// positive definite.
    pub fn from_matrix(center: (f64, f64), m: [f64; 3]) -> Option<Self> {
        if m.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let eigen = SymmetricEigen::new(Matrix2::new(m[0], m[1], m[1], m[2]));
        let (l0, l1) = (eigen.eigenvalues[0], eigen.eigenvalues[1]);
        if l0 <= 0.0 || l1 <= 0.0 {
            return None;
        }
        // The major axis belongs to the smaller eigenvalue.
        let k = if l0 <= l1 { 0 } else { 1 };
        let axis = eigen.eigenvectors.column(k);
        let norm = axis[0].hypot(axis[1]);
        Some(Ellipse {
            center,
            semi_major: 1.0 / l0.min(l1).sqrt(),
            semi_minor: 1.0 / l0.max(l1).sqrt(),
            major_axis: (axis[0] / norm, axis[1] / norm),
        })
    }

    /// Converts the general conic `c0·x² + c1·xy + c2·y² + c3·x + c4·y + c5 = 0`.
    /// Returns `None` when the conic is not a real, non-degenerate ellipse.
    ///
    /// # Examples
    /// ```
    /// # use coreg::ellipse::Ellipse;
    /// // (x - 3)² / 4 + (y + 1)² = 1
    /// let e = Ellipse::from_conic(&[0.25, 0.0, 1.0, -1.5, 2.0, 2.25]).unwrap();
    /// assert!((e.center().0 - 3.0).abs() < 1e-12 && (e.center().1 + 1.0).abs() < 1e-12);
    /// assert!((e.semi_major() - 2.0).abs() < 1e-12);
    /// ```
    pub fn from_conic(c: &[f64; 6]) -> Option<Self> {
        let det = 4.0 * c[0] * c[2] - c[1] * c[1];
        if det.is_nan() || det <= 0.0 {
            return None;
        }
        // Stationary point of the quadratic form.
        let cx = (c[1] * c[4] - 2.0 * c[2] * c[3]) / det;
        let cy = (c[1] * c[3] - 2.0 * c[0] * c[4]) / det;
        let f0 = c[0] * cx * cx + c[1] * cx * cy + c[2] * cy * cy + c[3] * cx + c[4] * cy + c[5];
        if f0 == 0.0 || !f0.is_finite() {
            return None;
        }
        let s = -1.0 / f0;
        Self::from_matrix((cx, cy), [c[0] * s, 0.5 * c[1] * s, c[2] * s])
    }

    pub fn center(&self) -> (f64, f64) {
        self.center
    }

    pub fn semi_major(&self) -> f64 {
        self.semi_major
    }

    pub fn semi_minor(&self) -> f64 {
        self.semi_minor
    }

    pub fn major_axis(&self) -> (f64, f64) {
        self.major_axis
    }

    pub fn minor_axis(&self) -> (f64, f64) {
        (-self.major_axis.1, self.major_axis.0)
    }

    /// Angle of the major axis from +sample, in radians.
    pub fn angle(&self) -> f64 {
        self.major_axis.1.atan2(self.major_axis.0)
    }

    pub fn area(&self) -> f64 {
        std::f64::consts::PI * self.semi_major * self.semi_minor
    }

    /// Coefficients `[A, B, C]` of the centred form
    /// `A·dx² + B·dx·dy + C·dy² = 1`.
    pub fn quadratic(&self) -> [f64; 3] {
        let (u0, u1) = self.major_axis;
        let ia = 1.0 / (self.semi_major * self.semi_major);
        let ib = 1.0 / (self.semi_minor * self.semi_minor);
        [
            u0 * u0 * ia + u1 * u1 * ib,
            2.0 * u0 * u1 * (ia - ib),
            u1 * u1 * ia + u0 * u0 * ib,
        ]
    }

    /// `(p - c)ᵀ M (p - c)`: below 1 inside, 1 on the curve.
    pub fn level(&self, x: f64, y: f64) -> f64 {
        let (u, v) = self.local(x, y);
        (u / self.semi_major).powi(2) + (v / self.semi_minor).powi(2)
    }

    /// Closed interior test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.level(x, y) <= 1.0
    }

    /// `true` when the point is inside or no farther than `play` from the curve.
    pub fn within(&self, x: f64, y: f64, play: f64) -> bool {
        self.contains(x, y) || self.distance(x, y) <= play
    }

    /// First-order distance to the curve: the conic residual over its
    /// gradient norm. Cheap, and exact in the limit of points on the curve.
    pub fn approximate_distance(&self, x: f64, y: f64) -> f64 {
        let (u, v) = self.local(x, y);
        let (a2, b2) = (self.semi_major * self.semi_major, self.semi_minor * self.semi_minor);
        let residual = u * u / a2 + v * v / b2 - 1.0;
        let gradient = (2.0 * u / a2).hypot(2.0 * v / b2);
        if gradient == 0.0 {
            // The centre: the nearest curve point is the end of the minor axis.
            return self.semi_minor;
        }
        residual.abs() / gradient
    }

    /// Euclidean distance from the point to the nearest point on the curve,
    /// for points inside and outside alike.
    ///
    /// The nearest point is found by bracketing the root of the
    /// characteristic function in the ellipse's own frame and bisecting.
    pub fn distance(&self, x: f64, y: f64) -> f64 {
        let (u, v) = self.local(x, y);
        let (y0, y1) = (u.abs(), v.abs());
        let (e0, e1) = (self.semi_major, self.semi_minor);

        if y1 > 0.0 {
            if y0 > 0.0 {
                let z0 = y0 / e0;
                let z1 = y1 / e1;
                let g = z0 * z0 + z1 * z1 - 1.0;
                if g == 0.0 {
                    return 0.0;
                }
                let r0 = (e0 / e1).powi(2);
                let s = characteristic_root(r0, z0, z1, g);
                let x0 = r0 * y0 / (s + r0);
                let x1 = y1 / (s + 1.0);
                (x0 - y0).hypot(x1 - y1)
            } else {
                (y1 - e1).abs()
            }
        } else {
            let numer = e0 * y0;
            let denom = e0 * e0 - e1 * e1;
            if numer < denom {
                let ratio = numer / denom;
                let x0 = e0 * ratio;
                let x1 = e1 * (1.0 - ratio * ratio).sqrt();
                (x0 - y0).hypot(x1)
            } else {
                (y0 - e0).abs()
            }
        }
    }

    /// Axis-aligned bounds `(min_sample, min_line, max_sample, max_line)`.
    pub fn bounding_box(&self) -> (f64, f64, f64, f64) {
        let (c, s) = self.major_axis;
        let (a, b) = (self.semi_major, self.semi_minor);
        let half_s = ((a * c).powi(2) + (b * s).powi(2)).sqrt();
        let half_l = ((a * s).powi(2) + (b * c).powi(2)).sqrt();
        (
            self.center.0 - half_s,
            self.center.1 - half_l,
            self.center.0 + half_s,
            self.center.1 + half_l,
        )
    }

    /// `true` when the whole ellipse lies within `[1, samples] × [1, lines]`.
    pub fn inside_chip(&self, samples: usize, lines: usize) -> bool {
        let (min_s, min_l, max_s, max_l) = self.bounding_box();
        min_s >= 1.0 && min_l >= 1.0 && max_s <= samples as f64 && max_l <= lines as f64
    }

    /// Point in the ellipse frame: `u` along the major axis, `v` along the minor.
    fn local(&self, x: f64, y: f64) -> (f64, f64) {
        let (dx, dy) = (x - self.center.0, y - self.center.1);
        let (c, s) = self.major_axis;
        (dx * c + dy * s, -dx * s + dy * c)
    }
}

fn characteristic_root(r0: f64, z0: f64, z1: f64, g: f64) -> f64 {
    let n0 = r0 * z0;
    let mut s0 = z1 - 1.0;
    let mut s1 = if g < 0.0 { 0.0 } else { n0.hypot(z1) - 1.0 };
    let mut s = 0.0;
    for _ in 0..MAX_ROOT_ITERATIONS {
        s = 0.5 * (s0 + s1);
        if s == s0 || s == s1 {
            break;
        }
        let ratio0 = n0 / (s + r0);
        let ratio1 = z1 / (s + 1.0);
        let g = ratio0 * ratio0 + ratio1 * ratio1 - 1.0;
        if g > 0.0 {
            s0 = s;
        } else if g < 0.0 {
            s1 = s;
        } else {
            break;
        }
    }
    s
}

/// Fits a general conic to at least six points by algebraic least squares
/// and returns it when it is an ellipse.
///
/// Points are shifted to their centroid and scaled to a mean radius of √2;
/// the conic is the right singular vector of the smallest singular value of
/// the design matrix `[x², xy, y², x, y, 1]`.
pub fn fit_ellipse(points: &[(f64, f64)]) -> Option<Ellipse> {
    let n = points.len();
    if n < 6 {
        return None;
    }
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n as f64;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n as f64;
    let mean_dist = points
        .iter()
        .map(|p| (p.0 - mean_x).hypot(p.1 - mean_y))
        .sum::<f64>()
        / n as f64;
    let scale = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        return None;
    };

    let design = DMatrix::from_fn(n, 6, |i, j| {
        let x = (points[i].0 - mean_x) * scale;
        let y = (points[i].1 - mean_y) * scale;
        [x * x, x * y, y * y, x, y, 1.0][j]
    });
    // Work on the 6×6 scatter matrix so the SVD always has a full V.
    let scatter = design.transpose() * &design;
    let svd = scatter.svd(false, true);
    let v_t = svd.v_t?;
    let (k, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let c = v_t.row(k);

    let s2 = scale * scale;
    let (a, b, cc, d, e, f) = (c[0], c[1], c[2], c[3], c[4], c[5]);
    let conic = [
        a * s2,
        b * s2,
        cc * s2,
        -2.0 * a * s2 * mean_x - b * s2 * mean_y + d * scale,
        -b * s2 * mean_x - 2.0 * cc * s2 * mean_y + e * scale,
        a * s2 * mean_x * mean_x + b * s2 * mean_x * mean_y + cc * s2 * mean_y * mean_y
            - d * scale * mean_x
            - e * scale * mean_y
            + f,
    ];
    Ellipse::from_conic(&conic)
}
