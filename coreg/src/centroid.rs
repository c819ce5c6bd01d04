//! Sub-pixel location of bright marks by adaptive DN selection, elliptical
//! trimming and centre of mass.

use crate::chip::{Chip, Selection, SelectionChip};
use crate::ellipse::Ellipse;
use crate::ellipse_reducer::{EllipseReducer, EllipseReducerConfig};
use crate::error::{CoregError, Result};
use crate::raster::is_null;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Selection and trimming parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidConfig {
    /// Lowest DN that can be selected.
    pub min_dn: f64,
    /// Highest DN that can be selected.
    pub max_dn: f64,
    pub percent_selected: f64,
    pub play: f64,
    pub patience_limit: usize,
    /// Scan resolution in microns.
    pub pixel_size: f64,
    /// A priori semi-axes of the mark, in pixels.
    pub semi_major: f64,
    pub semi_minor: f64,
    pub seed: u64,
}

impl Default for CentroidConfig {
    fn default() -> Self {
        Self::for_pixel_size(5.0)
    }
}

impl CentroidConfig {
    /// Parameters for a scan at `pixel_size` microns: the mark is 60 pixels
    /// in radius at 5 µm and the play is `max(0.5, 10 / pixel_size)`.
    ///
    /// # Examples
    /// ```
    /// # use coreg::centroid::CentroidConfig;
    /// let config = CentroidConfig::for_pixel_size(10.0);
    /// assert_eq!(config.semi_major, 30.0);
    /// assert_eq!(config.play, 1.0);
    /// assert_eq!(CentroidConfig::chip_size(10.0), 100);
    /// ```
    pub fn for_pixel_size(pixel_size: f64) -> Self {
        let semi = 60.0 * 5.0 / pixel_size;
        CentroidConfig {
            min_dn: 12.0,
            max_dn: f64::MAX,
            percent_selected: 95.0,
            play: (10.0 / pixel_size).max(0.5),
            patience_limit: 2000,
            pixel_size,
            semi_major: semi,
            semi_minor: semi,
            seed: 0,
        }
    }

    /// Side of the chip that comfortably holds one mark.
    pub fn chip_size(pixel_size: f64) -> usize {
        (200.0 * 5.0 / pixel_size).ceil() as usize
    }

    /// Sets the DN range, e.g. `(3500, f64::MAX)` for 16-bit scans.
    pub fn with_dn_range(mut self, min_dn: f64, max_dn: f64) -> Self {
        self.min_dn = min_dn;
        self.max_dn = max_dn;
        self
    }

    pub fn reducer(&self) -> EllipseReducerConfig {
        EllipseReducerConfig {
            percent_selected: self.percent_selected,
            play: self.play,
            patience_limit: self.patience_limit,
            semi_major: self.semi_major,
            semi_minor: self.semi_minor,
            pixel_size: self.pixel_size,
            seed: self.seed,
            ..Default::default()
        }
    }
}

/// A refined mark position.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidResult {
    pub chip_sample: f64,
    pub chip_line: f64,
    pub cube_sample: f64,
    pub cube_line: f64,
    pub ellipse: Ellipse,
    /// Pixels left selected after trimming.
    pub selected: usize,
    /// Pixels removed by the elliptical trim.
    pub rejected: usize,
}

/// Locates a bright, roughly elliptical mark near the centre of a chip.
#[derive(Debug, Clone)]
pub struct AdaptiveCentroid {
    config: CentroidConfig,
}

impl AdaptiveCentroid {
    /// # Errors
    /// [`CoregError::InvalidArgument`] unless `min_dn < max_dn`.
    pub fn new(config: CentroidConfig) -> Result<Self> {
        if config.min_dn.is_nan() || config.max_dn.is_nan() || config.min_dn >= config.max_dn {
            return Err(CoregError::InvalidArgument(format!(
                "DN range [{}, {}] is empty",
                config.min_dn, config.max_dn
            )));
        }
        Ok(AdaptiveCentroid { config })
    }

    pub fn config(&self) -> &CentroidConfig {
        &self.config
    }

    /// Flood-fills from the chip tack over pixels inside the configured DN
    /// range.
    pub fn select(&self, chip: &Chip) -> Result<SelectionChip> {
        let (min, max) = (self.config.min_dn, self.config.max_dn);
        flood_select(chip, |v| v >= min && v <= max)
    }

    /// Like [`select`](Self::select), but first raises the lower bound to
    /// the 90th percentile of the chip border when that is brighter than
    /// the configured minimum; only pixels brighter than that level are
    /// then selected.
    pub fn select_adaptive(&self, chip: &Chip) -> Result<SelectionChip> {
        let max = self.config.max_dn;
        match border_percentile(chip) {
            Some(level) if level > self.config.min_dn => {
                debug!(level, min_dn = self.config.min_dn, "raised selection floor from chip border");
                flood_select(chip, |v| v > level && v <= max)
            }
            _ => self.select(chip),
        }
    }

    /// Adaptive selection, elliptical reduction and centre of mass. The
    /// chip's recorded position is moved to the result.
    ///
    /// # Errors
    /// - [`CoregError::InvalidChip`] for a chip too small to have an interior.
    /// - [`CoregError::NotConverged`] when no ellipse satisfies the reducer.
    pub fn refine(&self, chip: &mut Chip) -> Result<CentroidResult> {
        if chip.samples() < 3 || chip.lines() < 3 {
            return Err(CoregError::InvalidChip {
                samples: chip.samples(),
                lines: chip.lines(),
            });
        }
        let mut selection = self.select_adaptive(chip)?;
        let mut reducer = EllipseReducer::new(self.config.reducer());
        let ellipse = reducer.reduce(&mut selection).ok_or(CoregError::NotConverged {
            iterations: self.config.patience_limit,
        })?;
        let (chip_sample, chip_line) = center_of_mass(&selection)?;
        let (cube_sample, cube_line) = chip.set_chip_position(chip_sample, chip_line);
        Ok(CentroidResult {
            chip_sample,
            chip_line,
            cube_sample,
            cube_line,
            ellipse,
            selected: selection.count(Selection::Selected),
            rejected: selection.count(Selection::Rejected),
        })
    }
}

/// Unweighted mean position of the selected pixels.
///
/// # Errors
/// [`CoregError::InsufficientPoints`] when nothing is selected.
pub fn center_of_mass(selection: &SelectionChip) -> Result<(f64, f64)> {
    let (mut sum_s, mut sum_l, mut n) = (0.0, 0.0, 0usize);
    for (s, l) in selection.selected() {
        sum_s += s as f64;
        sum_l += l as f64;
        n += 1;
    }
    if n == 0 {
        return Err(CoregError::InsufficientPoints { found: 0, required: 1 });
    }
    Ok((sum_s / n as f64, sum_l / n as f64))
}

/// Mean position of the selected pixels weighted by their DN in `chip`.
///
/// # Errors
/// - [`CoregError::InvalidArgument`] when the chip and selection differ in
///   size or the selected DNs sum to zero.
/// - [`CoregError::InsufficientPoints`] when nothing is selected.
pub fn center_of_mass_weighted(chip: &Chip, selection: &SelectionChip) -> Result<(f64, f64)> {
    if chip.samples() != selection.samples() || chip.lines() != selection.lines() {
        return Err(CoregError::InvalidArgument(format!(
            "chip is {}x{} but selection is {}x{}",
            chip.samples(),
            chip.lines(),
            selection.samples(),
            selection.lines()
        )));
    }
    let (mut sum_s, mut sum_l, mut sum_dn, mut n) = (0.0, 0.0, 0.0, 0usize);
    for (s, l) in selection.selected() {
        let dn = chip.get(s, l);
        if is_null(dn) {
            continue;
        }
        sum_s += s as f64 * dn;
        sum_l += l as f64 * dn;
        sum_dn += dn;
        n += 1;
    }
    if n == 0 {
        return Err(CoregError::InsufficientPoints { found: 0, required: 1 });
    }
    if sum_dn == 0.0 {
        return Err(CoregError::InvalidArgument("selected DNs sum to zero".into()));
    }
    Ok((sum_s / sum_dn, sum_l / sum_dn))
}

/// The border DN that survives removing the brightest tenth of the border.
fn border_percentile(chip: &Chip) -> Option<f64> {
    let (samples, lines) = (chip.samples(), chip.lines());
    let mut border: Vec<f64> = Vec::with_capacity(2 * (samples + lines));
    for line in 1..=lines {
        for sample in 1..=samples {
            if line == 1 || line == lines || sample == 1 || sample == samples {
                let v = chip.get(sample, line);
                if !is_null(v) {
                    border.push(v);
                }
            }
        }
    }
    if border.is_empty() {
        return None;
    }
    border.sort_by(|a, b| b.total_cmp(a));
    Some(border[border.len() / 10])
}

/// Four-connected flood fill from the tack over pixels accepted by `accept`.
fn flood_select<F>(chip: &Chip, accept: F) -> Result<SelectionChip>
where
    F: Fn(f64) -> bool,
{
    let mut selection = SelectionChip::new(chip.samples(), chip.lines())?;
    let start = (chip.tack_sample(), chip.tack_line());
    let accepted = |s: usize, l: usize| {
        let v = chip.get(s, l);
        !is_null(v) && accept(v)
    };
    if !accepted(start.0, start.1) {
        return Ok(selection);
    }

    let mut queue = VecDeque::from([start]);
    selection.set(start.0, start.1, Selection::Selected);
    while let Some((s, l)) = queue.pop_front() {
        let neighbours = [(s.wrapping_sub(1), l), (s + 1, l), (s, l.wrapping_sub(1)), (s, l + 1)];
        for (ns, nl) in neighbours {
            if ns == 0 || nl == 0 || ns > chip.samples() || nl > chip.lines() {
                continue;
            }
            if selection.get(ns, nl) == Selection::Unselected && accepted(ns, nl) {
                selection.set(ns, nl, Selection::Selected);
                queue.push_back((ns, nl));
            }
        }
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// A bright disk on a dark background, with an optional bright streak
    /// leaving the disk to the right.
    fn mark(size: usize, center: (f64, f64), radius: f64, background: f64, streak: bool) -> Chip {
        Chip::from_fn(size, size, |s, l| {
            let (ds, dl) = (s as f64 - center.0, l as f64 - center.1);
            if ds.hypot(dl) <= radius {
                200.0
            } else if streak && l == center.1.round() as usize && ds > 0.0 && ds < radius + 12.0 {
                190.0
            } else {
                background + ((s * 7 + l * 3) % 5) as f64
            }
        })
        .unwrap()
    }

    fn config() -> CentroidConfig {
        // A 12 pixel mark, searched on a coarser candidate grid.
        CentroidConfig {
            patience_limit: 300,
            pixel_size: 5.0,
            seed: 11,
            ..CentroidConfig::for_pixel_size(25.0)
        }
    }

    #[test]
    fn reference_parameters() {
        let c = CentroidConfig::for_pixel_size(25.0);
        assert_eq!(c.semi_major, 12.0);
        assert_eq!(c.play, 0.5);
        assert_eq!(c.percent_selected, 95.0);
        assert_eq!(c.patience_limit, 2000);
        assert_eq!(CentroidConfig::chip_size(25.0), 40);
        assert_eq!(CentroidConfig::chip_size(7.0), 143);
        assert!(AdaptiveCentroid::new(c.with_dn_range(5.0, 5.0)).is_err());
    }

    #[test]
    fn fixed_and_adaptive_selection() {
        let chip = mark(41, (21.0, 21.0), 6.0, 50.0, false);
        let centroid = AdaptiveCentroid::new(config()).unwrap();

        // Everything is above the fixed floor of 12.
        let fixed = centroid.select(&chip).unwrap();
        assert_eq!(fixed.count(Selection::Selected), 41 * 41);

        let adaptive = centroid.select_adaptive(&chip).unwrap();
        let disk = (1..=41)
            .flat_map(|l| (1..=41).map(move |s| (s, l)))
            .filter(|&(s, l)| (s as f64 - 21.0).hypot(l as f64 - 21.0) <= 6.0)
            .count();
        assert_eq!(adaptive.count(Selection::Selected), disk);
        // The configuration itself is untouched.
        assert_eq!(centroid.config().min_dn, 12.0);
    }

    #[test]
    fn nothing_selected_when_centre_is_dark() {
        let chip = Chip::from_fn(9, 9, |_, _| 3.0).unwrap();
        let centroid = AdaptiveCentroid::new(config()).unwrap();
        let selection = centroid.select(&chip).unwrap();
        assert_eq!(selection.count(Selection::Selected), 0);
        assert!(matches!(
            center_of_mass(&selection),
            Err(CoregError::InsufficientPoints { .. })
        ));
    }

    #[test]
    fn weighted_center_of_mass() {
        let chip = Chip::from_fn(3, 1, |s, _| [1.0, 1.0, 2.0][s - 1]).unwrap();
        let mut selection = SelectionChip::new(3, 1).unwrap();
        for s in 1..=3 {
            selection.set(s, 1, Selection::Selected);
        }
        assert_eq!(center_of_mass(&selection).unwrap(), (2.0, 1.0));
        let (s, l) = center_of_mass_weighted(&chip, &selection).unwrap();
        assert_abs_diff_eq!(s, 9.0 / 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l, 1.0, epsilon = 1e-12);

        let other = SelectionChip::new(2, 1).unwrap();
        assert!(center_of_mass_weighted(&chip, &other).is_err());
    }

    #[test]
    fn refine_ignores_streak() {
        let center = (30.4, 29.0);
        let mut chip = mark(61, center, 12.0, 5.0, true);
        chip.tack_cube(1000.0, 500.0);
        let centroid = AdaptiveCentroid::new(config()).unwrap();
        let result = centroid.refine(&mut chip).unwrap();

        assert!(result.rejected > 0);
        assert_abs_diff_eq!(result.chip_sample, center.0, epsilon = 0.15);
        assert_abs_diff_eq!(result.chip_line, center.1, epsilon = 0.15);
        assert_abs_diff_eq!(result.cube_sample, 1000.0 + result.chip_sample - 31.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.cube_line, 500.0 + result.chip_line - 31.0, epsilon = 1e-9);
        assert_eq!(chip.cube_position(), (result.cube_sample, result.cube_line));
    }

    #[test]
    fn refine_rejects_tiny_chips() {
        let mut chip = Chip::new(2, 5).unwrap();
        let centroid = AdaptiveCentroid::new(config()).unwrap();
        assert!(matches!(centroid.refine(&mut chip), Err(CoregError::InvalidChip { .. })));
    }
}
