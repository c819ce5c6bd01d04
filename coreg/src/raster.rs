use image::{GrayImage, ImageBuffer, Luma};

/// The no-data marker. Any non-finite value read from a raster is treated as
/// no data.
pub const NULL: f64 = f64::NAN;

/// Returns `true` when `value` is the no-data marker (or otherwise not finite).
#[inline]
pub fn is_null(value: f64) -> bool {
    !value.is_finite()
}

/// Read access to a multi-band raster with 1-based `(sample, line, band)`
/// addressing.
pub trait RasterSource {
    /// Returns `(samples, lines, bands)`.
    fn dimensions(&self) -> (usize, usize, usize);

    /// Returns the value at `(sample, line, band)`, or [`NULL`] when the pixel
    /// is outside the raster or holds no data.
    fn value(&self, sample: i64, line: i64, band: usize) -> f64;

    fn samples(&self) -> usize {
        self.dimensions().0
    }

    fn lines(&self) -> usize {
        self.dimensions().1
    }

    fn bands(&self) -> usize {
        self.dimensions().2
    }
}

/// Write access to an output raster.
pub trait RasterSink {
    /// Prepares the sink for a raster of the given size. Called once before
    /// any write.
    fn allocate(&mut self, samples: usize, lines: usize, bands: usize);

    fn write(&mut self, sample: usize, line: usize, band: usize, value: f64);
}

/// An in-memory raster of `f64` values stored band by band, line by line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Raster {
    data: Vec<f64>,
    samples: usize,
    lines: usize,
    bands: usize,
}

impl Raster {
    /// Creates a raster filled with [`NULL`].
    pub fn new(samples: usize, lines: usize, bands: usize) -> Self {
        Raster {
            data: vec![NULL; samples * lines * bands],
            samples,
            lines,
            bands,
        }
    }

    /// Creates a single-band raster whose value at 1-based `(s, l)` is `f(s, l)`.
    ///
    /// # Examples
    /// ```
    /// # use coreg::raster::{Raster, RasterSource};
    /// let ramp = Raster::from_fn(8, 8, |s, l| (s + l) as f64);
    /// assert_eq!(ramp.value(3, 4, 1), 7.0);
    /// ```
    pub fn from_fn<F>(samples: usize, lines: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        let mut raster = Self::new(samples, lines, 1);
        for line in 1..=lines {
            for sample in 1..=samples {
                raster.set(sample, line, 1, f(sample, line));
            }
        }
        raster
    }

    /// Creates a single-band raster from rows of equal length, top line first.
    ///
    /// # Panics
    /// Panics if the rows differ in length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let lines = rows.len();
        let samples = rows.first().map_or(0, |r| r.len());
        assert!(rows.iter().all(|r| r.len() == samples), "ragged raster rows");
        Raster {
            data: rows.concat(),
            samples,
            lines,
            bands: 1,
        }
    }

    fn index(&self, sample: usize, line: usize, band: usize) -> usize {
        ((band - 1) * self.lines + (line - 1)) * self.samples + (sample - 1)
    }

    fn in_bounds(&self, sample: i64, line: i64, band: usize) -> bool {
        sample >= 1
            && line >= 1
            && band >= 1
            && sample as usize <= self.samples
            && line as usize <= self.lines
            && band <= self.bands
    }

    /// Stores a value; out-of-range coordinates are ignored.
    pub fn set(&mut self, sample: usize, line: usize, band: usize, value: f64) {
        if self.in_bounds(sample as i64, line as i64, band) {
            let index = self.index(sample, line, band);
            self.data[index] = value;
        }
    }

    /// Returns the values of one band, line by line.
    ///
    /// # Panics
    /// Panics unless `1 <= band <= bands`.
    pub fn band(&self, band: usize) -> &[f64] {
        let len = self.samples * self.lines;
        &self.data[(band - 1) * len..band * len]
    }

    /// Copies every pixel of this raster into `sink`, allocating it first.
    pub fn copy_to<S: RasterSink + ?Sized>(&self, sink: &mut S) {
        sink.allocate(self.samples, self.lines, self.bands);
        for band in 1..=self.bands {
            for line in 1..=self.lines {
                for sample in 1..=self.samples {
                    sink.write(sample, line, band, self.data[self.index(sample, line, band)]);
                }
            }
        }
    }

    /// Converts an 8-bit grayscale image to a single-band raster.
    pub fn from_gray(image: &GrayImage) -> Self {
        Raster::from_fn(image.width() as usize, image.height() as usize, |s, l| {
            image.get_pixel(s as u32 - 1, l as u32 - 1).0[0] as f64
        })
    }

    /// Renders one band to an 8-bit grayscale image. Values are rounded and
    /// clamped to `0..=255`; no-data pixels become `0`.
    pub fn to_gray(&self, band: usize) -> GrayImage {
        ImageBuffer::from_fn(self.samples as u32, self.lines as u32, |x, y| {
            let v = self.value(x as i64 + 1, y as i64 + 1, band);
            let v = if is_null(v) { 0.0 } else { v.round().clamp(0.0, 255.0) };
            Luma([v as u8])
        })
    }
}

impl RasterSource for Raster {
    fn dimensions(&self) -> (usize, usize, usize) {
        (self.samples, self.lines, self.bands)
    }

    fn value(&self, sample: i64, line: i64, band: usize) -> f64 {
        if self.in_bounds(sample, line, band) {
            self.data[self.index(sample as usize, line as usize, band)]
        } else {
            NULL
        }
    }
}

impl RasterSink for Raster {
    fn allocate(&mut self, samples: usize, lines: usize, bands: usize) {
        *self = Raster::new(samples, lines, bands);
    }

    fn write(&mut self, sample: usize, line: usize, band: usize, value: f64) {
        self.set(sample, line, band, value);
    }
}

impl RasterSource for GrayImage {
    fn dimensions(&self) -> (usize, usize, usize) {
        (self.width() as usize, self.height() as usize, 1)
    }

    fn value(&self, sample: i64, line: i64, band: usize) -> f64 {
        if band != 1 || sample < 1 || line < 1 {
            return NULL;
        }
        if sample as u64 > self.width() as u64 || line as u64 > self.height() as u64 {
            return NULL;
        }
        self.get_pixel(sample as u32 - 1, line as u32 - 1).0[0] as f64
    }
}

impl RasterSource for ImageBuffer<Luma<f32>, Vec<f32>> {
    fn dimensions(&self) -> (usize, usize, usize) {
        (self.width() as usize, self.height() as usize, 1)
    }

    fn value(&self, sample: i64, line: i64, band: usize) -> f64 {
        if band != 1 || sample < 1 || line < 1 {
            return NULL;
        }
        if sample as u64 > self.width() as u64 || line as u64 > self.height() as u64 {
            return NULL;
        }
        self.get_pixel(sample as u32 - 1, line as u32 - 1).0[0] as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_based_addressing() {
        let r = Raster::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(r.dimensions(), (2, 2, 1));
        assert_eq!(r.value(1, 1, 1), 1.0);
        assert_eq!(r.value(2, 1, 1), 2.0);
        assert_eq!(r.value(1, 2, 1), 3.0);
        assert!(is_null(r.value(0, 1, 1)));
        assert!(is_null(r.value(3, 1, 1)));
        assert!(is_null(r.value(1, 1, 2)));
    }

    #[test]
    #[should_panic]
    fn band_zero_is_out_of_range() {
        Raster::new(2, 2, 1).band(0);
    }

    #[test]
    fn multi_band_storage() {
        let mut r = Raster::new(3, 2, 2);
        r.set(3, 2, 2, 9.0);
        assert_eq!(r.value(3, 2, 2), 9.0);
        assert!(is_null(r.value(3, 2, 1)));
        assert_eq!(r.band(2)[5], 9.0);
    }

    #[test]
    fn gray_image_round_trip() {
        let img = GrayImage::from_fn(4, 3, |x, y| Luma([(x + 10 * y) as u8]));
        assert_eq!(img.value(2, 3, 1), 21.0);
        assert!(is_null(img.value(5, 1, 1)));
        let raster = Raster::from_gray(&img);
        assert_eq!(raster.to_gray(1), img);
    }

    #[test]
    fn copy_to_sink() {
        let src = Raster::from_fn(3, 3, |s, l| (s * l) as f64);
        let mut dst = Raster::default();
        src.copy_to(&mut dst);
        assert_eq!(src, dst);
    }
}
