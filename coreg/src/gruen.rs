//! Adaptive least-squares chip matching.
//!
//! A pattern chip is matched against a larger search chip by solving, one
//! linearisation at a time, for the six coefficients of a pattern→search
//! affine together with a radiometric gain and shift:
//!
//! ```text
//! pattern(x) ≈ gain · search(T(x)) + shift
//! ```
//!
//! Each iteration resamples the search chip through the current `T`,
//! accumulates the 8×8 normal equations over the interior pattern pixels and
//! applies the solved update. When the update falls under the per-parameter
//! thresholds the covariance of the two translation terms is reduced to its
//! eigenvalues, whose magnitude is the reported fit metric.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::{Matrix2, SMatrix, SVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::affine::Affine;
use crate::chip::Chip;
use crate::error::{CoregError, Result};
use crate::interpolator::Interpolator;

/// Six affine coefficients, then shift and gain.
pub const PARAMETERS: usize = 8;

type Normal = SMatrix<f64, PARAMETERS, PARAMETERS>;
type Vector8 = SVector<f64, PARAMETERS>;

/// Forward-matrix cells updated by `alpha[0..6]`.
const AFFINE_CELLS: [(usize, usize); 6] = [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)];

/// Tunables of the matcher. Tolerances left at `None` are not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GruenConfig {
    pub max_iterations: usize,
    /// Convergence limit on the two translation terms, in pixels.
    pub translation_tolerance: f64,
    /// Scale change allowed at the chip edge, in pixels.
    pub scale_tolerance: f64,
    /// Shear change allowed at the chip edge, in pixels.
    pub shear_tolerance: f64,
    /// Stop when the residual sum changes by less than this between
    /// iterations.
    pub residual_tolerance: Option<f64>,
    /// Largest distance the tack may move from its starting cube position.
    pub affine_tolerance: Option<f64>,
    pub radiometric_shift_tolerance: Option<f64>,
    pub radiometric_gain_minimum: Option<f64>,
    pub radiometric_gain_maximum: Option<f64>,
    pub eigen_tolerance: Option<f64>,
    /// Share of the interior pattern pixels that must take part, in percent.
    pub pattern_valid_percent: f64,
    /// Bound on the per-axis scale of the accumulated affine.
    pub maximum_scale: f64,
    pub default_gain: f64,
    pub default_shift: f64,
    pub interpolator: Interpolator,
}

impl Default for GruenConfig {
    fn default() -> Self {
        GruenConfig {
            max_iterations: 25,
            translation_tolerance: 0.1,
            scale_tolerance: 0.5,
            shear_tolerance: 0.5,
            residual_tolerance: None,
            affine_tolerance: None,
            radiometric_shift_tolerance: None,
            radiometric_gain_minimum: None,
            radiometric_gain_maximum: None,
            eigen_tolerance: None,
            pattern_valid_percent: 50.0,
            maximum_scale: 4.0,
            default_gain: 1.0,
            default_shift: 0.0,
            interpolator: Interpolator::CubicConvolution,
        }
    }
}

impl GruenConfig {
    /// Convergence limits for `alpha[0..6]` on a `samples`×`lines` pattern.
    ///
    /// Scale and shear tolerances are pixel displacements at the chip edge,
    /// so they are divided by the half-width of the axis they multiply.
    pub fn thresholds(&self, samples: usize, lines: usize) -> [f64; 6] {
        let half_s = (samples as f64 - 1.0) / 2.0;
        let half_l = (lines as f64 - 1.0) / 2.0;
        [
            self.scale_tolerance / half_s,
            self.shear_tolerance / half_l,
            self.translation_tolerance,
            self.shear_tolerance / half_s,
            self.scale_tolerance / half_l,
            self.translation_tolerance,
        ]
    }

    /// Fewest points accepted out of `total`; the count must exceed it.
    pub fn min_valid_points(&self, total: usize) -> usize {
        let by_percent = (total as f64 * self.pattern_valid_percent / 100.0) as usize;
        by_percent.max(PARAMETERS)
    }
}

/// How a registration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GruenOutcome {
    Success,
    NotEnoughPoints,
    Singular,
    AffineNotInvertible,
    MaxIterationsExceeded,
    RadiometricShiftExceeded,
    RadiometricGainExceeded,
    EigenExceeded,
    AffineDistanceExceeded,
}

impl GruenOutcome {
    fn from_error(err: &CoregError) -> Option<Self> {
        match err {
            CoregError::InsufficientPoints { .. } => Some(GruenOutcome::NotEnoughPoints),
            CoregError::Singular { .. } => Some(GruenOutcome::Singular),
            CoregError::NotInvertible => Some(GruenOutcome::AffineNotInvertible),
            _ => None,
        }
    }
}

impl fmt::Display for GruenOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GruenOutcome::Success => "Success",
            GruenOutcome::NotEnoughPoints => "NotEnoughPoints",
            GruenOutcome::Singular => "Singular",
            GruenOutcome::AffineNotInvertible => "AffineNotInvertible",
            GruenOutcome::MaxIterationsExceeded => "MaxIterationsExceeded",
            GruenOutcome::RadiometricShiftExceeded => "RadiometricShiftExceeded",
            GruenOutcome::RadiometricGainExceeded => "RadiometricGainExceeded",
            GruenOutcome::EigenExceeded => "EigenExceeded",
            GruenOutcome::AffineDistanceExceeded => "AffineDistanceExceeded",
        };
        f.write_str(name)
    }
}

/// Keys of [`GruenResult::log_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GruenLogKey {
    GoodnessOfFit,
    MaximumResidual,
    MinimumEigenvalue,
    Eigenvalue,
    Shift,
    Gain,
    NumberIterations,
}

impl fmt::Display for GruenLogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One linearisation: the normal equations and their solution.
#[derive(Debug, Clone, PartialEq)]
struct Solution {
    points: usize,
    residual: f64,
    max_residual: f64,
    ata: Normal,
    atl: Vector8,
    alpha: Vector8,
    covariance: Matrix2<f64>,
    eigenvalues: [f64; 2],
}

/// Everything known about one registration.
#[derive(Debug, Clone, PartialEq)]
pub struct GruenResult {
    pub outcome: GruenOutcome,
    /// Linearisations solved, including a failing one.
    pub iterations: usize,
    /// Pixels used by the last linearisation.
    pub points: usize,
    /// Sum of squared radiometric residuals of the last linearisation.
    pub residual: f64,
    pub max_residual: f64,
    pub ata: SMatrix<f64, PARAMETERS, PARAMETERS>,
    pub atl: SVector<f64, PARAMETERS>,
    /// The last update vector.
    pub alpha: SVector<f64, PARAMETERS>,
    /// Covariance of the sample and line translation terms.
    pub covariance: Matrix2<f64>,
    /// Eigenvalues of `covariance`, largest first.
    pub eigenvalues: [f64; 2],
    pub gain: f64,
    pub shift: f64,
    /// Cube position the pattern tack started on.
    pub start: (f64, f64),
    /// Cube position the pattern tack ended on.
    pub finish: (f64, f64),
    /// Pattern-relative chip coordinates to cube coordinates.
    pub affine: Affine,
    failure: Option<CoregError>,
}

impl GruenResult {
    fn new(start: (f64, f64), gain: f64, shift: f64) -> Self {
        GruenResult {
            outcome: GruenOutcome::MaxIterationsExceeded,
            iterations: 0,
            points: 0,
            residual: 0.0,
            max_residual: 0.0,
            ata: Normal::zeros(),
            atl: Vector8::zeros(),
            alpha: Vector8::zeros(),
            covariance: Matrix2::zeros(),
            eigenvalues: [0.0; 2],
            gain,
            shift,
            start,
            finish: start,
            affine: Affine::identity(),
            failure: None,
        }
    }

    fn record(&mut self, solution: Solution) {
        self.points = solution.points;
        self.residual = solution.residual;
        self.max_residual = solution.max_residual;
        self.ata = solution.ata;
        self.atl = solution.atl;
        self.alpha = solution.alpha;
        self.covariance = solution.covariance;
        self.eigenvalues = solution.eigenvalues;
    }

    pub fn is_success(&self) -> bool {
        self.outcome == GruenOutcome::Success
    }

    /// `√(λ₁² + λ₂²)` of the translation covariance; smaller is better.
    pub fn eigen(&self) -> f64 {
        (self.eigenvalues[0].powi(2) + self.eigenvalues[1].powi(2)).sqrt()
    }

    pub fn goodness_of_fit(&self) -> f64 {
        self.eigen()
    }

    /// Residual variance, `Σr² / (N − 8)`.
    pub fn variance(&self) -> f64 {
        variance(self.residual, self.points)
    }

    /// Distance between the start and finish positions.
    pub fn error_magnitude(&self) -> f64 {
        (self.finish.0 - self.start.0).hypot(self.finish.1 - self.start.1)
    }

    pub fn log_data(&self) -> Vec<(GruenLogKey, f64)> {
        vec![
            (GruenLogKey::GoodnessOfFit, self.goodness_of_fit()),
            (GruenLogKey::MaximumResidual, self.max_residual),
            (GruenLogKey::MinimumEigenvalue, self.eigenvalues[1]),
            (GruenLogKey::Eigenvalue, self.eigen()),
            (GruenLogKey::Shift, self.shift),
            (GruenLogKey::Gain, self.gain),
            (GruenLogKey::NumberIterations, self.iterations as f64),
        ]
    }

    /// The error kind behind a numeric failure. Successes and rejections
    /// by a post-convergence tolerance have none.
    pub fn error(&self) -> Option<CoregError> {
        match self.outcome {
            GruenOutcome::NotEnoughPoints | GruenOutcome::Singular => self.failure.clone(),
            GruenOutcome::AffineNotInvertible => Some(CoregError::NotInvertible),
            GruenOutcome::MaxIterationsExceeded => Some(CoregError::NotConverged {
                iterations: self.iterations,
            }),
            _ => None,
        }
    }
}

/// Count, extremes, mean and spread of a stream of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStatistics {
    count: usize,
    sum: f64,
    sum_squares: f64,
    minimum: f64,
    maximum: f64,
}

impl Default for RunningStatistics {
    fn default() -> Self {
        RunningStatistics {
            count: 0,
            sum: 0.0,
            sum_squares: 0.0,
            minimum: f64::INFINITY,
            maximum: f64::NEG_INFINITY,
        }
    }
}

impl RunningStatistics {
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
        self.minimum = self.minimum.min(value);
        self.maximum = self.maximum.max(value);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn minimum(&self) -> Option<f64> {
        (self.count > 0).then_some(self.minimum)
    }

    pub fn maximum(&self) -> Option<f64> {
        (self.count > 0).then_some(self.maximum)
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Sample standard deviation; needs two values.
    pub fn standard_deviation(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let var = (self.sum_squares - self.sum * self.sum / n) / (n - 1.0);
        Some(var.max(0.0).sqrt())
    }
}

/// Totals gathered across the registrations of one matcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GruenStatistics {
    /// Linearisations solved, over every attempt.
    pub total_iterations: usize,
    pub attempts: usize,
    pub successes: usize,
    failures: BTreeMap<GruenOutcome, usize>,
    pub iterations: RunningStatistics,
    pub eigen: RunningStatistics,
    pub shift: RunningStatistics,
    pub gain: RunningStatistics,
}

impl GruenStatistics {
    fn add(&mut self, result: &GruenResult) {
        self.attempts += 1;
        if result.is_success() {
            self.successes += 1;
            self.iterations.add(result.iterations as f64);
            self.eigen.add(result.eigen());
            self.shift.add(result.shift);
            self.gain.add(result.gain);
        } else {
            *self.failures.entry(result.outcome).or_insert(0) += 1;
        }
    }

    /// Number of attempts that ended with `outcome`.
    pub fn failures(&self, outcome: GruenOutcome) -> usize {
        self.failures.get(&outcome).copied().unwrap_or(0)
    }

    /// Failure counts by outcome, in outcome order.
    pub fn failure_counts(&self) -> impl Iterator<Item = (GruenOutcome, usize)> + '_ {
        self.failures.iter().map(|(&o, &n)| (o, n))
    }
}

/// Iterative pattern-to-search matcher.
///
/// # Examples
/// ```
/// # use coreg::chip::Chip;
/// # use coreg::gruen::{GruenConfig, GruenMatcher};
/// let blob = |s: f64, l: f64| {
///     10.0 + 100.0 * (-((s - 2.0).powi(2) + (l + 1.0).powi(2)) / 72.0).exp()
///         + 60.0 * (-((s + 4.0).powi(2) + (l - 5.0).powi(2)) / 50.0).exp()
/// };
/// let mut search = Chip::from_fn(41, 41, |s, l| blob(s as f64 - 21.0, l as f64 - 21.0)).unwrap();
/// search.tack_cube(100.0, 100.0);
/// let pattern = Chip::from_fn(25, 25, |s, l| blob(s as f64 - 13.0 + 0.4, l as f64 - 13.0)).unwrap();
///
/// let mut matcher = GruenMatcher::new(GruenConfig::default());
/// let result = matcher.register(&pattern, &search, (21.0, 21.0)).unwrap();
/// assert!(result.is_success());
/// assert!((result.finish.0 - 100.4).abs() < 0.05);
/// ```
#[derive(Debug, Clone)]
pub struct GruenMatcher {
    config: GruenConfig,
    statistics: GruenStatistics,
}

impl GruenMatcher {
    pub fn new(config: GruenConfig) -> Self {
        GruenMatcher {
            config,
            statistics: GruenStatistics::default(),
        }
    }

    pub fn config(&self) -> &GruenConfig {
        &self.config
    }

    pub fn statistics(&self) -> &GruenStatistics {
        &self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics = GruenStatistics::default();
    }

    /// Registers `pattern` against `search`, starting with the pattern tack
    /// on search chip position `best`.
    ///
    /// Algorithmic failures are reported through [`GruenResult::outcome`].
    ///
    /// # Errors
    /// [`CoregError::InvalidChip`] when the pattern is narrower than three
    /// pixels on either axis.
    pub fn register(&mut self, pattern: &Chip, search: &Chip, best: (f64, f64)) -> Result<GruenResult> {
        let (samples, lines) = (pattern.samples(), pattern.lines());
        if samples < 3 || lines < 3 {
            return Err(CoregError::InvalidChip { samples, lines });
        }

        let offset = (
            best.0 - search.tack_sample() as f64,
            best.1 - search.tack_line() as f64,
        );
        let start = search.affine().compute(offset.0, offset.1);
        let mut result = GruenResult::new(start, self.config.default_gain, self.config.default_shift);

        let mut tform = Affine::identity();
        tform.translate(offset.0, offset.1);
        let thresholds = self.config.thresholds(samples, lines);
        let mut previous_residual: Option<f64> = None;
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            self.statistics.total_iterations += 1;
            result.iterations = iteration + 1;

            let subsearch = search.extract_affine(samples, lines, &tform, self.config.interpolator)?;
            let solution = match self.accumulate(pattern, &subsearch, result.gain, result.shift, iteration) {
                Ok(solution) => solution,
                Err(err) => {
                    result.outcome = GruenOutcome::from_error(&err).ok_or_else(|| err.clone())?;
                    if let CoregError::InsufficientPoints { found, .. } = err {
                        result.points = found;
                    }
                    result.failure = Some(err);
                    return Ok(self.conclude(result));
                }
            };

            let alpha = solution.alpha;
            let residual = solution.residual;
            debug!(
                iteration,
                points = solution.points,
                residual,
                eigen = (solution.eigenvalues[0].powi(2) + solution.eigenvalues[1].powi(2)).sqrt(),
                "gruen iteration"
            );
            result.record(solution);

            tform = match update_affine(&tform, &alpha) {
                Ok(t) if t.is_scale_valid(self.config.maximum_scale) => t,
                _ => {
                    result.outcome = GruenOutcome::AffineNotInvertible;
                    return Ok(self.conclude(result));
                }
            };
            result.shift += alpha[6];
            result.gain += alpha[7];

            // Tested on the update just applied, not the one before it.
            if iteration > 0 && alpha.iter().zip(&thresholds).all(|(a, t)| a.abs() < *t) {
                converged = true;
                break;
            }
            if let (Some(tolerance), Some(previous)) = (self.config.residual_tolerance, previous_residual) {
                if (previous - residual).abs() < tolerance {
                    converged = true;
                    break;
                }
            }
            previous_residual = Some(residual);
        }

        result.affine = tform.then(search.affine());
        result.finish = result.affine.compute(0.0, 0.0);
        result.outcome = if converged {
            self.check_constraints(&result)
        } else {
            GruenOutcome::MaxIterationsExceeded
        };
        Ok(self.conclude(result))
    }

    /// Solves one linearisation of two equally sized chips and returns its
    /// fit metric, without iterating or touching the statistics.
    ///
    /// # Errors
    /// [`CoregError::InvalidArgument`] for chips of different sizes,
    /// [`CoregError::InsufficientPoints`] and [`CoregError::Singular`] as
    /// for one iteration of [`GruenMatcher::register`].
    pub fn match_chips(&self, pattern: &Chip, subsearch: &Chip) -> Result<f64> {
        let solution = self.accumulate(
            pattern,
            subsearch,
            self.config.default_gain,
            self.config.default_shift,
            0,
        )?;
        let [l1, l2] = solution.eigenvalues;
        Ok((l1 * l1 + l2 * l2).sqrt())
    }

    fn check_constraints(&self, result: &GruenResult) -> GruenOutcome {
        let c = &self.config;
        if c.radiometric_shift_tolerance.is_some_and(|t| result.shift.abs() > t) {
            return GruenOutcome::RadiometricShiftExceeded;
        }
        if c.radiometric_gain_minimum.is_some_and(|t| result.gain < t)
            || c.radiometric_gain_maximum.is_some_and(|t| result.gain > t)
        {
            return GruenOutcome::RadiometricGainExceeded;
        }
        if c.eigen_tolerance.is_some_and(|t| result.eigen() > t) {
            return GruenOutcome::EigenExceeded;
        }
        if c.affine_tolerance.is_some_and(|t| result.error_magnitude() > t) {
            return GruenOutcome::AffineDistanceExceeded;
        }
        GruenOutcome::Success
    }

    fn conclude(&mut self, result: GruenResult) -> GruenResult {
        debug!(
            outcome = %result.outcome,
            iterations = result.iterations,
            eigen = result.eigen(),
            "gruen registration finished"
        );
        self.statistics.add(&result);
        result
    }

    fn accumulate(
        &self,
        pattern: &Chip,
        subsearch: &Chip,
        gain: f64,
        shift: f64,
        iteration: usize,
    ) -> Result<Solution> {
        if pattern.samples() != subsearch.samples() || pattern.lines() != subsearch.lines() {
            return Err(CoregError::InvalidArgument(format!(
                "pattern is {}x{} but subsearch is {}x{}",
                pattern.samples(),
                pattern.lines(),
                subsearch.samples(),
                subsearch.lines()
            )));
        }

        let tack_s = pattern.tack_sample() as f64;
        let tack_l = pattern.tack_line() as f64;
        let mut ata = Normal::zeros();
        let mut atl = Vector8::zeros();
        let mut residual = 0.0;
        let mut max_residual: f64 = 0.0;
        let mut points = 0usize;

        for line in 2..pattern.lines() {
            for sample in 2..pattern.samples() {
                if !pattern.is_valid(sample, line)
                    || !subsearch.is_valid(sample, line)
                    || !subsearch.is_valid(sample + 1, line)
                    || !subsearch.is_valid(sample - 1, line)
                    || !subsearch.is_valid(sample, line + 1)
                    || !subsearch.is_valid(sample, line - 1)
                {
                    continue;
                }

                let x0 = sample as f64 - tack_s;
                let y0 = line as f64 - tack_l;
                let value = subsearch.get(sample, line);
                let gx = gain * (subsearch.get(sample + 1, line) - subsearch.get(sample - 1, line)) / 2.0;
                let gy = gain * (subsearch.get(sample, line + 1) - subsearch.get(sample, line - 1)) / 2.0;

                let a = Vector8::from_column_slice(&[gx * x0, gx * y0, gx, gy * x0, gy * y0, gy, 1.0, value]);
                let ell = pattern.get(sample, line) - (gain * value + shift);

                ata += a * a.transpose();
                atl += a * ell;
                residual += ell * ell;
                max_residual = max_residual.max(ell.abs());
                points += 1;
            }
        }

        let total = (pattern.lines() - 1) * (pattern.samples() - 1);
        let required = self.config.min_valid_points(total);
        if points <= required {
            return Err(CoregError::InsufficientPoints {
                found: points,
                required: required + 1,
            });
        }

        let inverse = invert(&ata).ok_or(CoregError::Singular { iteration })?;
        let alpha = inverse * atl;
        let kmat = inverse * variance(residual, points);
        let covariance = Matrix2::new(kmat[(2, 2)], kmat[(2, 5)], kmat[(5, 2)], kmat[(5, 5)]);
        let eigen = SymmetricEigen::new(covariance).eigenvalues;
        if !alpha.iter().all(|v| v.is_finite()) || !eigen.iter().all(|v| v.is_finite()) {
            return Err(CoregError::Singular { iteration });
        }
        let eigenvalues = if eigen[0] >= eigen[1] {
            [eigen[0], eigen[1]]
        } else {
            [eigen[1], eigen[0]]
        };

        Ok(Solution {
            points,
            residual,
            max_residual,
            ata,
            atl,
            alpha,
            covariance,
            eigenvalues,
        })
    }
}

fn variance(residual: f64, points: usize) -> f64 {
    if points > PARAMETERS {
        residual / (points - PARAMETERS) as f64
    } else {
        f64::NAN
    }
}

/// Cholesky inverse of the normal matrix, or an LU inverse when it is not
/// positive definite.
fn invert(ata: &Normal) -> Option<Normal> {
    let inverse = match ata.cholesky() {
        Some(cholesky) => cholesky.inverse(),
        None => ata.lu().try_inverse()?,
    };
    inverse.iter().all(|v| v.is_finite()).then_some(inverse)
}

fn update_affine(tform: &Affine, alpha: &Vector8) -> Result<Affine> {
    let mut forward = *tform.forward();
    for (k, &cell) in AFFINE_CELLS.iter().enumerate() {
        forward[cell] += alpha[k];
    }
    Affine::from_forward(forward)
}
