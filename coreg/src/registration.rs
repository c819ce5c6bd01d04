//! Top-level routines: fit a warp to tie points and resample a raster with
//! it, report residuals, and refine tie points by centroiding and Gruen
//! matching before warping.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::centroid::{AdaptiveCentroid, CentroidConfig};
use crate::chip::Chip;
use crate::error::CoregError;
use crate::gruen::{GruenConfig, GruenMatcher, GruenOutcome, GruenStatistics};
use crate::interpolator::Interpolator;
use crate::raster::{is_null, Raster, RasterSink, RasterSource};
use crate::rubber_sheet::{GeomMode, Hooks, RubberSheet};
use crate::tie_point::{TiePoint, TiePointSource};
use crate::transform::Transform;
use crate::warp_transform::{fit_polynomial_warp, WarpTransform};

/// How the warp is fitted and rendered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpConfig {
    /// Polynomial degree of both axis fits.
    pub degree: usize,
    /// Re-solve the fit per output pixel with inverse-distance weights.
    pub weighted: bool,
    pub interpolator: Interpolator,
    pub mode: GeomMode,
    pub parallel: bool,
    /// `(samples, lines)` of the output; the input size when unset.
    pub output_size: Option<(usize, usize)>,
}

impl Default for WarpConfig {
    fn default() -> Self {
        WarpConfig {
            degree: 1,
            weighted: false,
            interpolator: Interpolator::CubicConvolution,
            mode: GeomMode::PerPixel,
            parallel: false,
            output_size: None,
        }
    }
}

/// Fit residual of one tie point, fitted input minus known input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Residual {
    pub point_index: usize,
    pub line_residual: f64,
    pub sample_residual: f64,
}

/// A failed driver invocation, with the residuals known at the time.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "registration failed at {}: {kind}",
    .point.map_or_else(|| "the transform".to_string(), |p| format!("tie point {p}"))
)]
pub struct RegistrationError {
    #[source]
    pub kind: CoregError,
    /// Source position of the offending tie point, if one is to blame.
    pub point: Option<usize>,
    pub residuals: Vec<Residual>,
}

impl From<CoregError> for RegistrationError {
    fn from(kind: CoregError) -> Self {
        RegistrationError {
            kind,
            point: None,
            residuals: Vec::new(),
        }
    }
}

/// Summary of a completed warp.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpReport {
    /// Active tie points used by the fit.
    pub points: usize,
    pub residuals: Vec<Residual>,
    pub output_samples: usize,
    pub output_lines: usize,
    /// Output pixels, over all bands, left without data.
    pub no_data: usize,
}

impl WarpReport {
    /// Root mean square of the `(line, sample)` residuals.
    pub fn rms(&self) -> (f64, f64) {
        rms(&self.residuals)
    }
}

fn rms(residuals: &[Residual]) -> (f64, f64) {
    if residuals.is_empty() {
        return (0.0, 0.0);
    }
    let n = residuals.len() as f64;
    let line = residuals.iter().map(|r| r.line_residual.powi(2)).sum::<f64>() / n;
    let sample = residuals.iter().map(|r| r.sample_residual.powi(2)).sum::<f64>() / n;
    (line.sqrt(), sample.sqrt())
}

/// Residuals of `warp`, indexed by the order its points were fitted in.
pub fn residual_table(warp: &WarpTransform) -> Vec<Residual> {
    warp.residuals()
        .into_iter()
        .enumerate()
        .map(|(point_index, (line_residual, sample_residual))| Residual {
            point_index,
            line_residual,
            sample_residual,
        })
        .collect()
}

/// Fits a warp to the active tie points of `source` and renders `input`
/// through it into `sink`.
///
/// The output is rendered into a staging raster and copied to `sink` only
/// once rendering finished, so a failed call leaves `sink` untouched.
/// Residual indices refer to positions in `source`.
///
/// # Errors
/// [`CoregError::Empty`] when `source` has no active records and
/// [`CoregError::Underdetermined`] when they cannot support the degree.
///
/// # Examples
/// ```
/// # use coreg::interpolator::Interpolator;
/// # use coreg::raster::Raster;
/// # use coreg::registration::{warp_raster, WarpConfig};
/// # use coreg::rubber_sheet::Hooks;
/// # use coreg::tie_point::TiePoint;
/// let input = Raster::from_fn(4, 4, |s, l| (s + 4 * (l - 1)) as f64);
/// let points = vec![
///     TiePoint::new(1.0, 1.0, 1.0, 1.0),
///     TiePoint::new(4.0, 1.0, 4.0, 1.0),
///     TiePoint::new(1.0, 4.0, 1.0, 4.0),
///     TiePoint::new(4.0, 4.0, 4.0, 4.0),
/// ];
/// let config = WarpConfig { interpolator: Interpolator::NearestNeighbour, ..WarpConfig::default() };
/// let mut output = Raster::default();
/// let report = warp_raster(&points, &input, &mut output, &config, Hooks::default()).unwrap();
/// assert_eq!(output, input);
/// assert_eq!(report.points, 4);
/// ```
pub fn warp_raster<T, R, S>(
    source: &T,
    input: &R,
    sink: &mut S,
    config: &WarpConfig,
    hooks: Hooks<'_>,
) -> Result<WarpReport, RegistrationError>
where
    T: TiePointSource + ?Sized,
    R: RasterSource + Sync + ?Sized,
    S: RasterSink + ?Sized,
{
    let active = source.active();
    if active.is_empty() {
        return Err(CoregError::Empty.into());
    }
    let points: Vec<TiePoint> = active.iter().map(|(_, p)| *p).collect();
    let input_dims = (input.samples(), input.lines());
    let output_dims = config.output_size.unwrap_or(input_dims);

    let warp = fit_polynomial_warp(config.degree, config.weighted, &points, input_dims, output_dims)?;
    let residuals: Vec<Residual> = residual_table(&warp)
        .into_iter()
        .map(|r| Residual {
            point_index: active[r.point_index].0,
            ..r
        })
        .collect();
    let (rms_line, rms_sample) = rms(&residuals);
    info!(
        points = points.len(),
        degree = config.degree,
        weighted = config.weighted,
        rms_line,
        rms_sample,
        "fitted warp transform"
    );

    let mut staging = Raster::default();
    RubberSheet::new(config.interpolator)
        .with_mode(config.mode)
        .with_parallel(config.parallel)
        .run_with_hooks(input, &Transform::from(warp), &mut staging, hooks);

    let no_data = (1..=staging.bands())
        .map(|band| staging.band(band).iter().filter(|v| is_null(**v)).count())
        .sum();
    staging.copy_to(sink);
    info!(
        samples = output_dims.0,
        lines = output_dims.1,
        no_data,
        "warped raster"
    );

    Ok(WarpReport {
        points: points.len(),
        residuals,
        output_samples: output_dims.0,
        output_lines: output_dims.1,
        no_data,
    })
}

/// Parameters of the tie-point refinement pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Run the adaptive centroid on each input mark first.
    pub use_centroid: bool,
    /// Follow up with a Gruen match against the reference.
    pub use_gruen: bool,
    pub centroid: CentroidConfig,
    /// Side of the chip the centroid is searched in.
    pub centroid_chip: usize,
    pub gruen: GruenConfig,
    /// `(samples, lines)` of the reference pattern chip.
    pub pattern_size: (usize, usize),
    /// `(samples, lines)` of the input search chip.
    pub search_size: (usize, usize),
    pub band: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        RefinementConfig {
            use_centroid: true,
            use_gruen: true,
            centroid: CentroidConfig::default(),
            centroid_chip: CentroidConfig::chip_size(5.0),
            gruen: GruenConfig::default(),
            pattern_size: (31, 31),
            search_size: (51, 51),
            band: 1,
        }
    }
}

/// What happened to one tie point.
#[derive(Debug, Clone, PartialEq)]
pub enum RefinementStatus {
    Refined,
    CentroidFailed(CoregError),
    MatchFailed(GruenOutcome),
}

/// Per-point record of a refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRefinement {
    /// Position in the tie-point source.
    pub index: usize,
    pub coarse: (f64, f64),
    /// Input coordinate after refinement; `coarse` when refinement failed.
    pub refined: (f64, f64),
    pub status: RefinementStatus,
}

/// Result of [`refine_tie_points`].
#[derive(Debug, Clone)]
pub struct Refinement {
    /// Every record of the source, active ones carrying refined input
    /// coordinates.
    pub tie_points: Vec<TiePoint>,
    pub points: Vec<PointRefinement>,
    pub statistics: GruenStatistics,
}

impl Refinement {
    pub fn refined(&self) -> usize {
        self.points
            .iter()
            .filter(|p| p.status == RefinementStatus::Refined)
            .count()
    }
}

/// Refines the input coordinate of every active tie point.
///
/// Each input mark is first located by [`AdaptiveCentroid`] in a chip of
/// `input`; the reference neighbourhood of the tie point's output
/// coordinate is then matched into `input` around that position. Points
/// whose centroid or match does not converge keep their coarse coordinate.
///
/// # Errors
/// - [`CoregError::Empty`] for a source without active records.
/// - Configuration errors, which apply to every point alike.
/// - Any structural error met while refining a point, such as a pattern
///   with too few valid pixels; [`RegistrationError::point`] names it.
pub fn refine_tie_points<R1, R2, T>(
    input: &R1,
    reference: &R2,
    source: &T,
    config: &RefinementConfig,
) -> Result<Refinement, RegistrationError>
where
    R1: RasterSource + ?Sized,
    R2: RasterSource + ?Sized,
    T: TiePointSource + ?Sized,
{
    let mut tie_points = source.tie_points();
    let active = source.active();
    if active.is_empty() {
        return Err(CoregError::Empty.into());
    }

    let centroid = AdaptiveCentroid::new(config.centroid.clone())?;
    let mut matcher = GruenMatcher::new(config.gruen);
    let mut points = Vec::with_capacity(active.len());

    for (index, point) in active {
        let at_point = |kind: CoregError| RegistrationError {
            kind,
            point: Some(index),
            residuals: Vec::new(),
        };
        let coarse = point.input();
        let mut estimate = coarse;
        let mut status = RefinementStatus::Refined;

        if config.use_centroid {
            let mut chip = Chip::new(config.centroid_chip, config.centroid_chip).map_err(at_point)?;
            chip.tack_cube(coarse.0.round(), coarse.1.round());
            chip.load(input, config.band, 0.0, 1.0, Interpolator::NearestNeighbour)
                .map_err(at_point)?;
            match centroid.refine(&mut chip) {
                Ok(found) => estimate = (found.cube_sample, found.cube_line),
                Err(err) if err.is_structural() => return Err(at_point(err)),
                Err(err) => {
                    warn!(index, error = %err, "centroid refinement failed, keeping coarse coordinate");
                    status = RefinementStatus::CentroidFailed(err);
                }
            }
        }

        if config.use_gruen && status == RefinementStatus::Refined {
            let interpolator = config.gruen.interpolator;
            let (ps, pl) = config.pattern_size;
            let mut pattern = Chip::new(ps, pl).map_err(at_point)?;
            pattern.tack_cube(point.out_sample, point.out_line);
            pattern
                .load(reference, config.band, 0.0, 1.0, interpolator)
                .map_err(at_point)?;

            let (ss, sl) = config.search_size;
            let mut search = Chip::new(ss, sl).map_err(at_point)?;
            search.tack_cube(estimate.0, estimate.1);
            search.load(input, config.band, 0.0, 1.0, interpolator).map_err(at_point)?;

            let best = (search.tack_sample() as f64, search.tack_line() as f64);
            let result = matcher.register(&pattern, &search, best).map_err(at_point)?;
            if let Some(err) = result.error().filter(CoregError::is_structural) {
                return Err(at_point(err));
            }
            if result.is_success() {
                estimate = result.finish;
            } else {
                warn!(index, outcome = %result.outcome, "gruen match failed, keeping coarse coordinate");
                status = RefinementStatus::MatchFailed(result.outcome);
            }
        }

        let refined = if status == RefinementStatus::Refined {
            estimate
        } else {
            coarse
        };
        tie_points[index] = point.with_input(refined.0, refined.1);
        points.push(PointRefinement {
            index,
            coarse,
            refined,
            status,
        });
    }

    let refinement = Refinement {
        tie_points,
        points,
        statistics: matcher.statistics().clone(),
    };
    info!(
        points = refinement.points.len(),
        refined = refinement.refined(),
        "refined tie points"
    );
    Ok(refinement)
}

/// Refines the tie points of `source` and warps `input` with the result.
/// The output defaults to the size of `reference`.
pub fn refine_and_warp<R1, R2, T, S>(
    input: &R1,
    reference: &R2,
    source: &T,
    refinement: &RefinementConfig,
    warp: &WarpConfig,
    sink: &mut S,
    hooks: Hooks<'_>,
) -> Result<(Refinement, WarpReport), RegistrationError>
where
    R1: RasterSource + Sync + ?Sized,
    R2: RasterSource + ?Sized,
    T: TiePointSource + ?Sized,
    S: RasterSink + ?Sized,
{
    let refined = refine_tie_points(input, reference, source, refinement)?;
    let config = WarpConfig {
        output_size: warp
            .output_size
            .or(Some((reference.samples(), reference.lines()))),
        ..*warp
    };
    let report = warp_raster(&refined.tie_points, input, sink, &config, hooks)?;
    Ok((refined, report))
}
