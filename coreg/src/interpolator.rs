//! Reconstruction of raster values at fractional `(sample, line)` positions.
//!
//! Three kernels are provided:
//!
//! - **Nearest neighbour**: the pixel whose centre is closest. 1×1 support.
//! - **Bilinear**: linear in both axes over the 2×2 neighbourhood whose top-left
//!   pixel is `(floor(s), floor(l))`.
//! - **Cubic convolution**: Keys' cubic kernel with `a = -0.5` over a 4×4
//!   neighbourhood. Reproduces constants, linear and quadratic ramps exactly.
//!
//! Interpolation never extrapolates: if any pixel of the neighbourhood is
//! outside the raster or holds no data the result is
//! [`CoregError::OutOfDomain`].

use crate::error::{CoregError, Result};
use crate::raster::{is_null, RasterSource};
use serde::{Deserialize, Serialize};

/// Coordinates within this distance of an integer are snapped onto it before
/// the neighbourhood is chosen, so that a fitted transform returning
/// `0.999999999999` for pixel 1 does not pull in pixel 0.
const SNAP_TOLERANCE: f64 = 1e-9;

/// Cubic convolution kernel parameter.
const KEYS_A: f64 = -0.5;

/// The interpolation kernels understood by the rubber-sheet engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolator {
    NearestNeighbour,
    #[default]
    Bilinear,
    CubicConvolution,
}

impl Interpolator {
    /// Width of the neighbourhood in samples.
    pub fn samples(&self) -> usize {
        match self {
            Interpolator::NearestNeighbour => 1,
            Interpolator::Bilinear => 2,
            Interpolator::CubicConvolution => 4,
        }
    }

    /// Height of the neighbourhood in lines.
    pub fn lines(&self) -> usize {
        self.samples()
    }

    /// Offset from `floor(s)` to the first sample of the neighbourhood.
    pub fn hot_sample(&self) -> i64 {
        match self {
            Interpolator::NearestNeighbour | Interpolator::Bilinear => 0,
            Interpolator::CubicConvolution => -1,
        }
    }

    pub fn hot_line(&self) -> i64 {
        self.hot_sample()
    }

    /// Interpolates band `band` of `raster` at 1-based `(sample, line)`.
    ///
    /// # Examples
    /// ```
    /// # use coreg::interpolator::Interpolator;
    /// # use coreg::raster::Raster;
    /// let ramp = Raster::from_fn(8, 8, |s, l| (s + l) as f64);
    /// let v = Interpolator::CubicConvolution.interpolate(&ramp, 3.9, 3.9, 1).unwrap();
    /// assert!((v - 7.8).abs() < 1e-9);
    /// ```
    pub fn interpolate<R>(&self, raster: &R, sample: f64, line: f64, band: usize) -> Result<f64>
    where
        R: RasterSource + ?Sized,
    {
        let out_of_domain = CoregError::OutOfDomain { sample, line };
        if !sample.is_finite() || !line.is_finite() {
            return Err(out_of_domain);
        }
        let s = snap(sample);
        let l = snap(line);

        let value = match self {
            Interpolator::NearestNeighbour => {
                raster.value((s + 0.5).floor() as i64, (l + 0.5).floor() as i64, band)
            }
            Interpolator::Bilinear => bilinear(raster, s, l, band),
            Interpolator::CubicConvolution => cubic_convolution(raster, s, l, band),
        };
        if is_null(value) {
            Err(out_of_domain)
        } else {
            Ok(value)
        }
    }
}

fn snap(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < SNAP_TOLERANCE {
        r
    } else {
        v
    }
}

fn bilinear<R: RasterSource + ?Sized>(raster: &R, s: f64, l: f64, band: usize) -> f64 {
    let s0 = s.floor();
    let l0 = l.floor();
    let fs = s - s0;
    let fl = l - l0;
    let (s0, l0) = (s0 as i64, l0 as i64);

    let p00 = raster.value(s0, l0, band);
    let p10 = raster.value(s0 + 1, l0, band);
    let p01 = raster.value(s0, l0 + 1, band);
    let p11 = raster.value(s0 + 1, l0 + 1, band);
    // NaN propagates through the arithmetic below.
    let top = p00 + fs * (p10 - p00);
    let bottom = p01 + fs * (p11 - p01);
    top + fl * (bottom - top)
}

/// Keys' cubic convolution kernel.
pub(crate) fn cubic_kernel(x: f64) -> f64 {
    let ax = x.abs();
    if ax <= 1.0 {
        ((KEYS_A + 2.0) * ax - (KEYS_A + 3.0)) * ax * ax + 1.0
    } else if ax < 2.0 {
        ((KEYS_A * ax - 5.0 * KEYS_A) * ax + 8.0 * KEYS_A) * ax - 4.0 * KEYS_A
    } else {
        0.0
    }
}

fn cubic_convolution<R: RasterSource + ?Sized>(raster: &R, s: f64, l: f64, band: usize) -> f64 {
    let s0 = s.floor();
    let l0 = l.floor();
    let fs = s - s0;
    let fl = l - l0;
    let (s0, l0) = (s0 as i64, l0 as i64);

    let ws = [
        cubic_kernel(fs + 1.0),
        cubic_kernel(fs),
        cubic_kernel(fs - 1.0),
        cubic_kernel(fs - 2.0),
    ];
    let wl = [
        cubic_kernel(fl + 1.0),
        cubic_kernel(fl),
        cubic_kernel(fl - 1.0),
        cubic_kernel(fl - 2.0),
    ];

    let mut sum = 0.0;
    for (j, wj) in wl.iter().enumerate() {
        let line = l0 - 1 + j as i64;
        for (i, wi) in ws.iter().enumerate() {
            let v = raster.value(s0 - 1 + i as i64, line, band);
            if is_null(v) {
                return v;
            }
            sum += v * wi * wj;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Raster, NULL};
    use approx::assert_abs_diff_eq;

    #[test]
    fn kernel_partition_of_unity() {
        for k in 0..=20 {
            let f = k as f64 / 20.0;
            let sum = cubic_kernel(f + 1.0) + cubic_kernel(f) + cubic_kernel(f - 1.0) + cubic_kernel(f - 2.0);
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-12);
        }
        assert_eq!(cubic_kernel(0.0), 1.0);
        assert_eq!(cubic_kernel(1.0), 0.0);
        assert_eq!(cubic_kernel(2.0), 0.0);
    }

    #[test]
    fn cubic_on_constant_and_ramp() {
        let constant = Raster::from_fn(8, 8, |_, _| 5.0);
        let v = Interpolator::CubicConvolution.interpolate(&constant, 4.3, 5.7, 1).unwrap();
        assert_abs_diff_eq!(v, 5.0, epsilon = 1e-12);

        let ramp = Raster::from_fn(8, 8, |s, l| (s + l) as f64);
        let v = Interpolator::CubicConvolution.interpolate(&ramp, 3.9, 3.9, 1).unwrap();
        assert_abs_diff_eq!(v, 7.8, epsilon = 1e-9);
    }

    #[test]
    fn cubic_reproduces_quadratic() {
        let quad = Raster::from_fn(10, 10, |s, l| (s * s) as f64 + 0.5 * (l * l) as f64);
        let v = Interpolator::CubicConvolution.interpolate(&quad, 5.25, 4.5, 1).unwrap();
        assert_abs_diff_eq!(v, 5.25 * 5.25 + 0.5 * 4.5 * 4.5, epsilon = 1e-9);
    }

    #[test]
    fn cubic_needs_two_pixel_margin() {
        let r = Raster::from_fn(8, 8, |_, _| 1.0);
        assert!(Interpolator::CubicConvolution.interpolate(&r, 2.0, 2.0, 1).is_ok());
        assert!(Interpolator::CubicConvolution.interpolate(&r, 6.5, 6.5, 1).is_ok());
        assert!(matches!(
            Interpolator::CubicConvolution.interpolate(&r, 1.5, 4.0, 1),
            Err(CoregError::OutOfDomain { .. })
        ));
        assert!(Interpolator::CubicConvolution.interpolate(&r, 4.0, 7.5, 1).is_err());
    }

    #[test]
    fn bilinear_boundaries() {
        let r = Raster::from_fn(4, 4, |s, l| (s + 4 * (l - 1)) as f64);
        assert_eq!(Interpolator::Bilinear.interpolate(&r, 1.0, 1.0, 1), Ok(1.0));
        assert_abs_diff_eq!(
            Interpolator::Bilinear.interpolate(&r, 1.5, 1.5, 1).unwrap(),
            3.5,
            epsilon = 1e-12
        );
        assert!(matches!(
            Interpolator::Bilinear.interpolate(&r, 4.0, 2.0, 1),
            Err(CoregError::OutOfDomain { .. })
        ));
        assert!(Interpolator::Bilinear.interpolate(&r, 2.0, 4.0, 1).is_err());
        assert!(Interpolator::Bilinear.interpolate(&r, 0.75, 2.0, 1).is_err());
    }

    #[test]
    fn bilinear_snaps_near_integer_coordinates() {
        let r = Raster::from_fn(4, 4, |s, _| s as f64);
        let v = Interpolator::Bilinear.interpolate(&r, 1.0 - 1e-13, 1.0, 1).unwrap();
        assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn nearest_rounds() {
        let r = Raster::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(Interpolator::NearestNeighbour.interpolate(&r, 1.49, 1.51, 1), Ok(3.0));
        assert_eq!(Interpolator::NearestNeighbour.interpolate(&r, 0.5, 0.5, 1), Ok(1.0));
        assert!(Interpolator::NearestNeighbour.interpolate(&r, 2.5, 1.0, 1).is_err());
    }

    #[test]
    fn no_data_in_neighbourhood_fails() {
        let mut r = Raster::from_fn(6, 6, |_, _| 2.0);
        r.set(3, 3, 1, NULL);
        assert!(Interpolator::Bilinear.interpolate(&r, 2.5, 2.5, 1).is_err());
        assert!(Interpolator::CubicConvolution.interpolate(&r, 3.5, 3.5, 1).is_err());
        assert_eq!(Interpolator::NearestNeighbour.interpolate(&r, 2.4, 2.4, 1), Ok(2.0));
    }

    #[test]
    fn neighbourhood_geometry() {
        assert_eq!(Interpolator::NearestNeighbour.samples(), 1);
        assert_eq!(Interpolator::Bilinear.lines(), 2);
        assert_eq!(Interpolator::CubicConvolution.samples(), 4);
        assert_eq!(Interpolator::CubicConvolution.hot_sample(), -1);
    }
}
