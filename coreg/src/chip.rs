//! Small rectangular windows of a raster, tied to raster coordinates by an
//! affine transform.
//!
//! A chip's own coordinates are 1-based `(sample, line)`. Its *tack* pixel,
//! `((n - 1) / 2) + 1` on each axis, is the origin of the chip-relative frame
//! that the chip→cube affine maps from. Loading a chip resamples the source
//! raster through that affine, so a rotated or scaled chip still reports
//! every position in cube coordinates.

use crate::affine::Affine;
use crate::error::{CoregError, Result};
use crate::interpolator::Interpolator;
use crate::raster::{is_null, RasterSource, NULL};

/// A single-band window with a chip→cube affine and a valid DN range.
#[derive(Debug, Clone, PartialEq)]
pub struct Chip {
    data: Vec<f64>,
    samples: usize,
    lines: usize,
    affine: Affine,
    chip_sample: f64,
    chip_line: f64,
    cube_sample: f64,
    cube_line: f64,
    valid_minimum: f64,
    valid_maximum: f64,
}

impl Chip {
    /// Creates a chip filled with [`NULL`], tacked at cube `(0, 0)`.
    ///
    /// # Errors
    /// [`CoregError::InvalidChip`] when either dimension is zero.
    pub fn new(samples: usize, lines: usize) -> Result<Self> {
        check_size(samples, lines)?;
        Ok(Chip {
            data: vec![NULL; samples * lines],
            samples,
            lines,
            affine: Affine::identity(),
            chip_sample: 0.0,
            chip_line: 0.0,
            cube_sample: 0.0,
            cube_line: 0.0,
            valid_minimum: f64::NEG_INFINITY,
            valid_maximum: f64::INFINITY,
        })
    }

    /// Creates a chip whose value at 1-based `(s, l)` is `f(s, l)`.
    ///
    /// # Examples
    /// ```
    /// # use coreg::chip::Chip;
    /// let chip = Chip::from_fn(5, 3, |s, l| (s * 10 + l) as f64).unwrap();
    /// assert_eq!((chip.tack_sample(), chip.tack_line()), (3, 2));
    /// assert_eq!(chip.get(3, 2), 32.0);
    /// ```
    pub fn from_fn<F>(samples: usize, lines: usize, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, usize) -> f64,
    {
        let mut chip = Chip::new(samples, lines)?;
        for line in 1..=lines {
            for sample in 1..=samples {
                chip.set(sample, line, f(sample, line));
            }
        }
        Ok(chip)
    }

    /// Changes the size, clearing the data and resetting the affine.
    pub fn resize(&mut self, samples: usize, lines: usize) -> Result<()> {
        check_size(samples, lines)?;
        self.data = vec![NULL; samples * lines];
        self.samples = samples;
        self.lines = lines;
        self.affine = Affine::identity();
        Ok(())
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn tack_sample(&self) -> usize {
        (self.samples - 1) / 2 + 1
    }

    pub fn tack_line(&self) -> usize {
        (self.lines - 1) / 2 + 1
    }

    /// Value at 1-based `(sample, line)`; [`NULL`] outside the chip.
    pub fn get(&self, sample: usize, line: usize) -> f64 {
        if sample == 0 || line == 0 || sample > self.samples || line > self.lines {
            return NULL;
        }
        self.data[(line - 1) * self.samples + (sample - 1)]
    }

    /// Stores a value; out-of-range coordinates are ignored.
    pub fn set(&mut self, sample: usize, line: usize, value: f64) {
        if sample >= 1 && line >= 1 && sample <= self.samples && line <= self.lines {
            self.data[(line - 1) * self.samples + (sample - 1)] = value;
        }
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Puts the chip tack on cube `(sample, line)` with no rotation or scale.
    pub fn tack_cube(&mut self, sample: f64, line: f64) {
        self.affine = Affine::identity();
        self.affine.translate(sample, line);
        self.cube_sample = sample;
        self.cube_line = line;
        self.chip_sample = self.tack_sample() as f64;
        self.chip_line = self.tack_line() as f64;
    }

    /// Cube coordinate under the chip tack.
    pub fn cube_tack(&self) -> (f64, f64) {
        self.affine.compute(0.0, 0.0)
    }

    /// The chip→cube transform, in tack-relative chip coordinates.
    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    pub fn set_affine(&mut self, affine: Affine) {
        self.affine = affine;
    }

    /// Converts a chip coordinate to cube coordinates and records both.
    pub fn set_chip_position(&mut self, sample: f64, line: f64) -> (f64, f64) {
        let (cs, cl) = self.chip_to_cube(sample, line);
        self.chip_sample = sample;
        self.chip_line = line;
        self.cube_sample = cs;
        self.cube_line = cl;
        (cs, cl)
    }

    /// Converts a cube coordinate to chip coordinates and records both. The
    /// result may lie outside the chip.
    pub fn set_cube_position(&mut self, sample: f64, line: f64) -> (f64, f64) {
        let (x, y) = self.affine.compute_inverse(sample, line);
        self.cube_sample = sample;
        self.cube_line = line;
        self.chip_sample = x + self.tack_sample() as f64;
        self.chip_line = y + self.tack_line() as f64;
        (self.chip_sample, self.chip_line)
    }

    /// The last recorded chip position.
    pub fn chip_position(&self) -> (f64, f64) {
        (self.chip_sample, self.chip_line)
    }

    /// The last recorded cube position.
    pub fn cube_position(&self) -> (f64, f64) {
        (self.cube_sample, self.cube_line)
    }

    fn chip_to_cube(&self, sample: f64, line: f64) -> (f64, f64) {
        self.affine.compute(
            sample - self.tack_sample() as f64,
            line - self.tack_line() as f64,
        )
    }

    /// Loads `band` of `raster` around the current cube tack, scaled by
    /// `scale` and rotated by `rotation` degrees about the tack.
    ///
    /// # Errors
    /// [`CoregError::NotInvertible`] for a zero scale.
    pub fn load<R>(
        &mut self,
        raster: &R,
        band: usize,
        rotation: f64,
        scale: f64,
        interpolator: Interpolator,
    ) -> Result<()>
    where
        R: RasterSource + ?Sized,
    {
        let (tack_s, tack_l) = self.cube_tack();
        let mut affine = Affine::identity();
        affine.scale(scale)?;
        affine.rotate(rotation);
        affine.translate(tack_s, tack_l);
        self.affine = affine;
        self.read(raster, band, interpolator);
        Ok(())
    }

    /// Loads `band` of `raster` through a caller-supplied chip→cube affine.
    pub fn load_with_affine<R>(&mut self, raster: &R, affine: Affine, band: usize, interpolator: Interpolator)
    where
        R: RasterSource + ?Sized,
    {
        self.affine = affine;
        self.set_chip_position(self.tack_sample() as f64, self.tack_line() as f64);
        self.read(raster, band, interpolator);
    }

    fn read<R: RasterSource + ?Sized>(&mut self, raster: &R, band: usize, interpolator: Interpolator) {
        let (max_s, max_l) = (raster.samples() as f64 + 0.5, raster.lines() as f64 + 0.5);
        for line in 1..=self.lines {
            for sample in 1..=self.samples {
                let (cs, cl) = self.chip_to_cube(sample as f64, line as f64);
                let value = if cs < 0.5 || cl < 0.5 || cs > max_s || cl > max_l {
                    NULL
                } else {
                    interpolator.interpolate(raster, cs, cl, band).unwrap_or(NULL)
                };
                self.data[(line - 1) * self.samples + (sample - 1)] = value;
            }
        }
    }

    /// Restricts the DN range counted as valid.
    ///
    /// # Errors
    /// [`CoregError::InvalidArgument`] unless `minimum < maximum`.
    pub fn set_valid_range(&mut self, minimum: f64, maximum: f64) -> Result<()> {
        if minimum.is_nan() || maximum.is_nan() || minimum >= maximum {
            return Err(CoregError::InvalidArgument(format!(
                "valid range [{minimum}, {maximum}] must have minimum below maximum"
            )));
        }
        self.valid_minimum = minimum;
        self.valid_maximum = maximum;
        Ok(())
    }

    pub fn valid_range(&self) -> (f64, f64) {
        (self.valid_minimum, self.valid_maximum)
    }

    /// `true` when the pixel holds data inside the valid range.
    pub fn is_valid(&self, sample: usize, line: usize) -> bool {
        let v = self.get(sample, line);
        !is_null(v) && v >= self.valid_minimum && v <= self.valid_maximum
    }

    /// `true` when at least `percentage` percent of the pixels are valid.
    pub fn is_valid_percent(&self, percentage: f64) -> bool {
        let valid = (1..=self.lines)
            .flat_map(|l| (1..=self.samples).map(move |s| (s, l)))
            .filter(|&(s, l)| self.is_valid(s, l))
            .count();
        100.0 * valid as f64 / (self.samples * self.lines) as f64 >= percentage
    }

    /// Cuts a `samples`×`lines` sub-chip whose tack sits on chip pixel
    /// `(sample, line)`. Pixels beyond this chip are [`NULL`]. The sub-chip
    /// maps to the same cube coordinates as this one.
    ///
    /// # Errors
    /// [`CoregError::InvalidChip`] when the sub-chip is empty or larger than
    /// this chip.
    pub fn extract(&self, samples: usize, lines: usize, sample: usize, line: usize) -> Result<Chip> {
        if samples > self.samples || lines > self.lines {
            return Err(CoregError::InvalidChip { samples, lines });
        }
        let mut chipped = Chip::new(samples, lines)?;
        let (ts, tl) = (chipped.tack_sample() as i64, chipped.tack_line() as i64);
        for oline in 1..=lines {
            for osamp in 1..=samples {
                let s = sample as i64 + (osamp as i64 - ts);
                let l = line as i64 + (oline as i64 - tl);
                chipped.set(osamp, oline, self.value(s, l, 1));
            }
        }

        let mut shift = Affine::identity();
        shift.translate(
            sample as f64 - self.tack_sample() as f64,
            line as f64 - self.tack_line() as f64,
        );
        chipped.affine = shift.then(&self.affine);
        chipped.valid_minimum = self.valid_minimum;
        chipped.valid_maximum = self.valid_maximum;
        chipped.set_chip_position(ts as f64, tl as f64);
        Ok(chipped)
    }

    /// Resamples this chip into a new `samples`×`lines` chip through
    /// `affine`, which maps tack-relative coordinates of the new chip to
    /// tack-relative coordinates of this one. The new chip's chip→cube
    /// transform is the composition of the two.
    ///
    /// # Examples
    /// ```
    /// # use coreg::affine::Affine;
    /// # use coreg::chip::Chip;
    /// # use coreg::interpolator::Interpolator;
    /// let mut chip = Chip::from_fn(9, 9, |s, l| (s + 10 * l) as f64).unwrap();
    /// chip.tack_cube(100.0, 200.0);
    /// let mut shift = Affine::identity();
    /// shift.translate(1.0, 0.0);
    /// let moved = chip.extract_affine(5, 5, &shift, Interpolator::Bilinear).unwrap();
    /// assert_eq!(moved.get(3, 3), chip.get(6, 5));
    /// assert_eq!(moved.cube_tack(), (101.0, 200.0));
    /// ```
    pub fn extract_affine(
        &self,
        samples: usize,
        lines: usize,
        affine: &Affine,
        interpolator: Interpolator,
    ) -> Result<Chip> {
        let mut chipped = Chip::new(samples, lines)?;
        let (ts, tl) = (chipped.tack_sample() as f64, chipped.tack_line() as f64);
        let (own_ts, own_tl) = (self.tack_sample() as f64, self.tack_line() as f64);
        for oline in 1..=lines {
            for osamp in 1..=samples {
                let (x, y) = affine.compute(osamp as f64 - ts, oline as f64 - tl);
                let value = interpolator
                    .interpolate(self, x + own_ts, y + own_tl, 1)
                    .unwrap_or(NULL);
                chipped.set(osamp, oline, value);
            }
        }
        chipped.affine = affine.then(&self.affine);
        chipped.valid_minimum = self.valid_minimum;
        chipped.valid_maximum = self.valid_maximum;
        chipped.set_chip_position(ts, tl);
        Ok(chipped)
    }
}

impl RasterSource for Chip {
    fn dimensions(&self) -> (usize, usize, usize) {
        (self.samples, self.lines, 1)
    }

    fn value(&self, sample: i64, line: i64, band: usize) -> f64 {
        if band != 1 || sample < 1 || line < 1 {
            return NULL;
        }
        self.get(sample as usize, line as usize)
    }
}

fn check_size(samples: usize, lines: usize) -> Result<()> {
    if samples == 0 || lines == 0 {
        Err(CoregError::InvalidChip { samples, lines })
    } else {
        Ok(())
    }
}

/// Per-pixel classification produced by centroid selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Unselected,
    Selected,
    Rejected,
}

/// A selection mask with the same 1-based addressing as [`Chip`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionChip {
    cells: Vec<Selection>,
    samples: usize,
    lines: usize,
}

impl SelectionChip {
    pub fn new(samples: usize, lines: usize) -> Result<Self> {
        check_size(samples, lines)?;
        Ok(SelectionChip {
            cells: vec![Selection::Unselected; samples * lines],
            samples,
            lines,
        })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Classification at `(sample, line)`; `Unselected` outside the mask.
    pub fn get(&self, sample: usize, line: usize) -> Selection {
        if sample == 0 || line == 0 || sample > self.samples || line > self.lines {
            return Selection::Unselected;
        }
        self.cells[(line - 1) * self.samples + (sample - 1)]
    }

    pub fn set(&mut self, sample: usize, line: usize, selection: Selection) {
        if sample >= 1 && line >= 1 && sample <= self.samples && line <= self.lines {
            self.cells[(line - 1) * self.samples + (sample - 1)] = selection;
        }
    }

    pub fn is_selected(&self, sample: usize, line: usize) -> bool {
        self.get(sample, line) == Selection::Selected
    }

    pub fn count(&self, selection: Selection) -> usize {
        self.cells.iter().filter(|c| **c == selection).count()
    }

    /// Coordinates of the selected pixels, line by line.
    pub fn selected(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.cells.iter().enumerate().filter_map(move |(i, c)| {
            (*c == Selection::Selected).then(|| (i % self.samples + 1, i / self.samples + 1))
        })
    }
}
