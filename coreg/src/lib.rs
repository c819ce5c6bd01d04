//! # Coreg Library
//!
//! The `coreg` library co-registers planetary images. It fits polynomial
//! warps to tie points, resamples rasters through them, and refines tie points
//! to sub-pixel precision by centroiding reseau marks and by adaptive
//! least-squares (Gruen) matching.
//!
//! ## Overview of Modules
//!
//! - **`basis_function`** / **`least_squares`**: Linear models over a set of basis
//!   terms and their weighted least-squares fit, solved by SVD or QR.
//!
//! - **`affine`**: A 2-D affine transform kept together with its inverse, with
//!   translation, rotation and scale helpers and a three-or-more point fit.
//!
//! - **`warp_transform`**: The output→input polynomial mapping fitted to tie points,
//!   optionally re-weighted by inverse distance for every query.
//!
//! - **`transform`** / **`rubber_sheet`**: The inverse mappings the resampling engine
//!   understands, and the engine itself (per-pixel or quad-tree, serial or on rayon).
//!
//! - **`interpolator`**: Nearest neighbour, bilinear and cubic convolution kernels.
//!
//! - **`raster`**: The `RasterSource` / `RasterSink` traits, an in-memory `Raster`, and
//!   adapters for `image` buffers.
//!
//! - **`chip`**: Small raster windows tied to cube coordinates by an affine, plus
//!   selection masks.
//!
//! - **`ellipse`** / **`ellipse_reducer`** / **`centroid`**: Sub-pixel location of reseau
//!   marks by DN selection, elliptical trimming and centre of mass.
//!
//! - **`gruen`**: The adaptive least-squares matcher.
//!
//! - **`mark_matcher`**: Pairs detected marks with their nominal positions.
//!
//! - **`registration`**: The driver: warp a raster from tie points, report residuals,
//!   and refine tie points before warping.
//!
//! Coordinates are 1-based `(sample, line)` throughout; missing data is [`raster::NULL`].

pub mod error;
pub mod numerics;

pub mod basis_function;
pub mod least_squares;
pub mod affine;

pub mod raster;
pub mod interpolator;
pub mod tie_point;
pub mod warp_transform;
pub mod transform;
pub mod rubber_sheet;

pub mod chip;
pub mod ellipse;
pub mod ellipse_reducer;
pub mod centroid;
pub mod gruen;
pub mod mark_matcher;

pub mod registration;

pub use error::{CoregError, Result};
pub use interpolator::Interpolator;
pub use raster::{Raster, RasterSink, RasterSource, NULL};
pub use registration::{refine_and_warp, refine_tie_points, residual_table, warp_raster};
pub use tie_point::{TiePoint, TiePointSource};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_reach_the_driver() {
        let input = Raster::from_fn(6, 6, |s, l| (s * l) as f64);
        let points = vec![
            TiePoint::new(1.0, 1.0, 1.0, 1.0),
            TiePoint::new(6.0, 1.0, 6.0, 1.0),
            TiePoint::new(1.0, 6.0, 1.0, 6.0),
        ];
        let config = registration::WarpConfig {
            interpolator: Interpolator::NearestNeighbour,
            ..Default::default()
        };
        let mut output = Raster::default();
        warp_raster(&points, &input, &mut output, &config, rubber_sheet::Hooks::default()).unwrap();
        assert_eq!(output, input);
        assert!(!VERSION.is_empty());
    }
}
