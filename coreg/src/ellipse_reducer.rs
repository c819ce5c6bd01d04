//! Trims a centroid selection down to the largest well-filled ellipse.
//!
//! Selections of dark fiducial marks often carry "hairs": thin runs of
//! selected pixels leaking along scratches or neighbouring features. The
//! reducer searches for the largest ellipse that is almost entirely selected
//! and lies inside the chip, then rejects selected pixels that stray from it
//! by more than the play.

use crate::chip::{Selection, SelectionChip};
use crate::ellipse::{fit_ellipse, Ellipse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Points a conic fit needs.
const MIN_FIT_POINTS: usize = 6;

/// Parameters of the elliptical reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EllipseReducerConfig {
    /// Minimum percentage of the pixels inside an accepted ellipse that must
    /// be selected.
    pub percent_selected: f64,
    /// Distance, in pixels, within which boundary points join a fit and
    /// selected pixels survive the final trim.
    pub play: f64,
    /// Consecutive rejected hypotheses before the search stops.
    pub patience_limit: usize,
    /// A priori semi-major axis of the mark, in pixels.
    pub semi_major: f64,
    /// A priori semi-minor axis of the mark, in pixels.
    pub semi_minor: f64,
    /// Ground pixel size; the candidate grid step scales with `5 / pixel_size`.
    pub pixel_size: f64,
    pub max_refine_iterations: usize,
    /// Seed of the candidate shuffle.
    pub seed: u64,
}

impl Default for EllipseReducerConfig {
    fn default() -> Self {
        EllipseReducerConfig {
            percent_selected: 95.0,
            play: 0.5,
            patience_limit: 2000,
            semi_major: 60.0,
            semi_minor: 60.0,
            pixel_size: 5.0,
            max_refine_iterations: 50,
            seed: 0,
        }
    }
}

/// Randomised search for the best-fitting selection ellipse.
///
/// # Examples
/// ```
/// # use coreg::chip::{Selection, SelectionChip};
/// # use coreg::ellipse_reducer::{EllipseReducer, EllipseReducerConfig};
/// let mut selection = SelectionChip::new(41, 41).unwrap();
/// for l in 1..=41 {
///     for s in 1..=41 {
///         let (ds, dl) = (s as f64 - 21.0, l as f64 - 21.0);
///         if ds.hypot(dl) <= 10.0 {
///             selection.set(s, l, Selection::Selected);
///         }
///     }
/// }
/// let config = EllipseReducerConfig {
///     semi_major: 10.0,
///     semi_minor: 10.0,
///     patience_limit: 50,
///     ..Default::default()
/// };
/// let ellipse = EllipseReducer::new(config).reduce(&mut selection).unwrap();
/// assert!((ellipse.center().0 - 21.0).abs() < 0.5);
/// ```
#[derive(Debug, Clone)]
pub struct EllipseReducer {
    config: EllipseReducerConfig,
    rng: StdRng,
}

impl EllipseReducer {
    pub fn new(config: EllipseReducerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        EllipseReducer { config, rng }
    }

    pub fn config(&self) -> &EllipseReducerConfig {
        &self.config
    }

    /// Finds the best ellipse for `selection` and marks every selected pixel
    /// farther than the play outside it as [`Selection::Rejected`].
    ///
    /// Returns `None`, leaving the selection untouched, when no hypothesis
    /// passes.
    pub fn reduce(&mut self, selection: &mut SelectionChip) -> Option<Ellipse> {
        let boundary = boundary_points(selection);
        if boundary.len() < MIN_FIT_POINTS {
            debug!(points = boundary.len(), "too few boundary points for an ellipse");
            return None;
        }
        let mut candidates = self.candidate_centers(selection.samples(), selection.lines());
        let total_candidates = candidates.len();

        let mut best: Option<Ellipse> = None;
        let mut failures = 0;
        while failures < self.config.patience_limit && !candidates.is_empty() {
            let index = self.rng.random_range(0..candidates.len());
            let center = candidates.swap_remove(index);
            match self.evaluate(center, &boundary, selection, best.as_ref()) {
                Some(ellipse) => {
                    best = Some(ellipse);
                    failures = 0;
                }
                None => failures += 1,
            }
        }

        let best = best?;
        let mut rejected = 0;
        for line in 1..=selection.lines() {
            for sample in 1..=selection.samples() {
                if selection.is_selected(sample, line)
                    && !best.within(sample as f64, line as f64, self.config.play)
                {
                    selection.set(sample, line, Selection::Rejected);
                    rejected += 1;
                }
            }
        }
        debug!(
            candidates = total_candidates,
            tried = total_candidates - candidates.len(),
            area = best.area(),
            rejected,
            "elliptical reduction complete"
        );
        Some(best)
    }

    /// Refines the hypothesis at `center` and applies the acceptance tests.
    fn evaluate(
        &self,
        center: (f64, f64),
        boundary: &[(f64, f64)],
        selection: &SelectionChip,
        best: Option<&Ellipse>,
    ) -> Option<Ellipse> {
        let hypothesis = Ellipse::new(center, self.config.semi_major, self.config.semi_minor, 0.0).ok()?;
        let ellipse = self.refine(hypothesis, boundary)?;
        if best.is_some_and(|b| ellipse.area() < b.area()) {
            return None;
        }
        if !ellipse.inside_chip(selection.samples(), selection.lines()) {
            return None;
        }
        (percent_selected(selection, &ellipse)? >= self.config.percent_selected).then_some(ellipse)
    }

    /// Re-fits the ellipse to the boundary points near it until the set of
    /// included points stops changing.
    fn refine(&self, mut ellipse: Ellipse, boundary: &[(f64, f64)]) -> Option<Ellipse> {
        let mut included: Vec<usize> = Vec::new();
        for _ in 0..self.config.max_refine_iterations {
            let near: Vec<usize> = (0..boundary.len())
                .filter(|&i| ellipse.approximate_distance(boundary[i].0, boundary[i].1) <= self.config.play)
                .collect();
            if near.len() < MIN_FIT_POINTS {
                return None;
            }
            if near == included {
                return Some(ellipse);
            }
            let points: Vec<(f64, f64)> = near.iter().map(|&i| boundary[i]).collect();
            ellipse = fit_ellipse(&points)?;
            included = near;
        }
        None
    }

    /// Candidate centres over `[a + 1, S - a] × [b + 1, L - b]`, denser
    /// towards the middle of the region.
    fn candidate_centers(&self, samples: usize, lines: usize) -> Vec<(f64, f64)> {
        let scale = 5.0 / self.config.pixel_size;
        let along_samples = axis_positions(
            self.config.semi_major + 1.0,
            samples as f64 - self.config.semi_major,
            scale,
        );
        let along_lines = axis_positions(
            self.config.semi_minor + 1.0,
            lines as f64 - self.config.semi_minor,
            scale,
        );
        along_lines
            .iter()
            .flat_map(|&l| along_samples.iter().map(move |&s| (s, l)))
            .collect()
    }
}

/// Positions in `[lo, hi]` spreading out from the midpoint with a step of
/// `scale` at the middle rising quadratically to `5·scale` at the ends.
fn axis_positions(lo: f64, hi: f64, scale: f64) -> Vec<f64> {
    if hi.is_nan() || lo.is_nan() || hi < lo || scale.is_nan() || scale <= 0.0 {
        return Vec::new();
    }
    let mid = 0.5 * (lo + hi);
    let half = 0.5 * (hi - lo);
    if half == 0.0 {
        return vec![mid];
    }
    let step_at = |pos: f64| scale * (1.0 + 4.0 * ((pos - mid) / half).powi(2));

    let mut positions = vec![mid];
    let mut pos = mid;
    loop {
        pos += step_at(pos);
        if pos > hi {
            break;
        }
        positions.push(pos);
    }
    let mut pos = mid;
    loop {
        pos -= step_at(pos);
        if pos < lo {
            break;
        }
        positions.push(pos);
    }
    positions
}

/// Selected pixels with at least one 4-neighbour that is not selected (or
/// lies outside the chip).
fn boundary_points(selection: &SelectionChip) -> Vec<(f64, f64)> {
    let mut points = Vec::new();
    for line in 1..=selection.lines() {
        for sample in 1..=selection.samples() {
            if !selection.is_selected(sample, line) {
                continue;
            }
            let edge = !selection.is_selected(sample - 1, line)
                || !selection.is_selected(sample + 1, line)
                || !selection.is_selected(sample, line - 1)
                || !selection.is_selected(sample, line + 1);
            if edge {
                points.push((sample as f64, line as f64));
            }
        }
    }
    points
}

/// Percentage of the pixels inside `ellipse` that are selected.
fn percent_selected(selection: &SelectionChip, ellipse: &Ellipse) -> Option<f64> {
    let (mut inside, mut selected) = (0usize, 0usize);
    let (min_s, min_l, max_s, max_l) = ellipse.bounding_box();
    let s_range = (min_s.floor().max(1.0) as usize)..=(max_s.ceil().min(selection.samples() as f64) as usize);
    for line in (min_l.floor().max(1.0) as usize)..=(max_l.ceil().min(selection.lines() as f64) as usize) {
        for sample in s_range.clone() {
            if ellipse.contains(sample as f64, line as f64) {
                inside += 1;
                if selection.is_selected(sample, line) {
                    selected += 1;
                }
            }
        }
    }
    (inside > 0).then(|| 100.0 * selected as f64 / inside as f64)
}
