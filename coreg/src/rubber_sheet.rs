//! The rubber-sheet engine: resamples an input raster into an output raster
//! through an inverse coordinate transform.
//!
//! For each output pixel the engine asks the [`Transform`] for the input
//! coordinate and the [`Interpolator`] for the value there. Coordinates
//! outside `[0.5, N + 0.5]`, unanswerable transform queries and
//! out-of-domain interpolations all produce [`NULL`].
//!
//! Two geometry modes are offered. `PerPixel` queries the transform for
//! every output pixel. `QuadTree` approximates the transform by a bilinear
//! mapping over square output quads, subdividing a quad whenever the
//! approximation misses the true transform at the quad midpoint by more than
//! the tolerance, and falling back to per-pixel queries for small quads.
//! The input coordinates are computed once and reused for every band.

use crate::interpolator::Interpolator;
use crate::raster::{RasterSink, RasterSource, NULL};
use crate::transform::Transform;
use nalgebra::Matrix4;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Quad subdivision parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadTreeConfig {
    /// Side of the initial output tiles, in pixels.
    pub start_size: usize,
    /// Quads whose side is below this are mapped pixel by pixel.
    pub end_size: usize,
    /// Largest accepted midpoint error of the bilinear approximation, in input pixels.
    pub tolerance: f64,
}

impl Default for QuadTreeConfig {
    fn default() -> Self {
        QuadTreeConfig {
            start_size: 128,
            end_size: 8,
            tolerance: 0.5,
        }
    }
}

/// How input coordinates are obtained for output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum GeomMode {
    #[default]
    PerPixel,
    QuadTree(QuadTreeConfig),
}

/// Optional observers invoked while the engine runs.
#[derive(Default)]
pub struct Hooks<'a> {
    /// Called with the 1-based band number before each band is rendered.
    pub band_change: Option<Box<dyn FnMut(usize) + 'a>>,
    /// Called with `(lines_done, lines_total)` after each output line, counted over all bands.
    pub progress: Option<Box<dyn FnMut(usize, usize) + 'a>>,
}

/// Input coordinates for every output pixel, row-major.
struct CoordinateMap {
    samples: usize,
    coords: Vec<Option<(f64, f64)>>,
}

impl CoordinateMap {
    fn new(samples: usize, lines: usize) -> Self {
        CoordinateMap {
            samples,
            coords: vec![None; samples * lines],
        }
    }

    fn row(&self, line: usize) -> &[Option<(f64, f64)>] {
        &self.coords[(line - 1) * self.samples..line * self.samples]
    }

    fn set(&mut self, sample: usize, line: usize, coord: Option<(f64, f64)>) {
        self.coords[(line - 1) * self.samples + (sample - 1)] = coord;
    }
}

/// Inclusive 1-based output rectangle.
#[derive(Debug, Clone, Copy)]
struct Quad {
    ss: usize,
    sl: usize,
    es: usize,
    el: usize,
}

/// Drives an output raster from an input raster, a transform and an
/// interpolator.
///
/// # Examples
/// ```
/// # use coreg::interpolator::Interpolator;
/// # use coreg::raster::{Raster, RasterSource};
/// # use coreg::rubber_sheet::RubberSheet;
/// # use coreg::transform::Transform;
/// let input = Raster::from_fn(4, 4, |s, l| (s + 4 * (l - 1)) as f64);
/// let mut output = Raster::default();
/// RubberSheet::new(Interpolator::NearestNeighbour).run(
///     &input,
///     &Transform::Identity { samples: 4, lines: 4 },
///     &mut output,
/// );
/// assert_eq!(output, input);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RubberSheet {
    interpolator: Interpolator,
    mode: GeomMode,
    parallel: bool,
}

impl RubberSheet {
    pub fn new(interpolator: Interpolator) -> Self {
        RubberSheet {
            interpolator,
            mode: GeomMode::PerPixel,
            parallel: false,
        }
    }

    pub fn with_mode(mut self, mode: GeomMode) -> Self {
        self.mode = mode;
        self
    }

    /// Renders disjoint output rows on the rayon pool.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn interpolator(&self) -> Interpolator {
        self.interpolator
    }

    pub fn run<R, S>(&self, input: &R, transform: &Transform, sink: &mut S)
    where
        R: RasterSource + Sync + ?Sized,
        S: RasterSink + ?Sized,
    {
        self.run_with_hooks(input, transform, sink, Hooks::default());
    }

    /// Renders every band of `input` into `sink`. The sink is allocated with
    /// the transform's output size and the input's band count.
    pub fn run_with_hooks<R, S>(&self, input: &R, transform: &Transform, sink: &mut S, mut hooks: Hooks<'_>)
    where
        R: RasterSource + Sync + ?Sized,
        S: RasterSink + ?Sized,
    {
        let (out_samples, out_lines) = (transform.output_samples(), transform.output_lines());
        let bands = input.bands();
        sink.allocate(out_samples, out_lines, bands);
        if out_samples == 0 || out_lines == 0 {
            return;
        }

        let map = match self.mode {
            GeomMode::PerPixel => self.map_per_pixel(transform, out_samples, out_lines),
            GeomMode::QuadTree(config) => map_quad_tree(transform, &config, out_samples, out_lines),
        };

        let (in_samples, in_lines) = (input.samples() as f64, input.lines() as f64);
        let total = out_lines * bands;
        let mut done = 0;
        for band in 1..=bands {
            if let Some(callback) = hooks.band_change.as_mut() {
                callback(band);
            }
            let render_row = |line: usize| -> Vec<f64> {
                map.row(line)
                    .iter()
                    .map(|coord| match *coord {
                        Some((s, l))
                            if s >= 0.5 && l >= 0.5 && s <= in_samples + 0.5 && l <= in_lines + 0.5 =>
                        {
                            self.interpolator.interpolate(input, s, l, band).unwrap_or(NULL)
                        }
                        _ => NULL,
                    })
                    .collect()
            };
            let rows: Vec<Vec<f64>> = if self.parallel {
                (1..=out_lines).into_par_iter().map(render_row).collect()
            } else {
                (1..=out_lines).map(render_row).collect()
            };
            for (line, row) in rows.into_iter().enumerate() {
                for (sample, value) in row.into_iter().enumerate() {
                    sink.write(sample + 1, line + 1, band, value);
                }
                done += 1;
                if let Some(callback) = hooks.progress.as_mut() {
                    callback(done, total);
                }
            }
        }
    }

    fn map_per_pixel(&self, transform: &Transform, samples: usize, lines: usize) -> CoordinateMap {
        let map_row = |line: usize| -> Vec<Option<(f64, f64)>> {
            (1..=samples)
                .map(|sample| transform.inverse_map(sample as f64, line as f64))
                .collect()
        };
        let rows: Vec<Vec<Option<(f64, f64)>>> = if self.parallel {
            (1..=lines).into_par_iter().map(map_row).collect()
        } else {
            (1..=lines).map(map_row).collect()
        };
        CoordinateMap {
            samples,
            coords: rows.concat(),
        }
    }
}

enum QuadStep {
    Done,
    Split,
    Slow,
}

fn map_quad_tree(transform: &Transform, config: &QuadTreeConfig, samples: usize, lines: usize) -> CoordinateMap {
    let start = config.start_size.max(2);
    let mut map = CoordinateMap::new(samples, lines);
    let mut stack = Vec::new();
    let mut fitted = 0usize;
    let mut slow = 0usize;

    for sl in (1..=lines).step_by(start) {
        for ss in (1..=samples).step_by(start) {
            stack.push(Quad {
                ss,
                sl,
                es: ss + start - 1,
                el: sl + start - 1,
            });
        }
    }

    while let Some(quad) = stack.pop() {
        match process_quad(transform, config, &quad, &mut map) {
            QuadStep::Done => fitted += 1,
            QuadStep::Split => {
                let ms = (quad.ss + quad.es) / 2;
                let ml = (quad.sl + quad.el) / 2;
                stack.push(Quad { ss: quad.ss, sl: quad.sl, es: ms, el: ml });
                stack.push(Quad { ss: ms + 1, sl: quad.sl, es: quad.es, el: ml });
                stack.push(Quad { ss: quad.ss, sl: ml + 1, es: ms, el: quad.el });
                stack.push(Quad { ss: ms + 1, sl: ml + 1, es: quad.es, el: quad.el });
            }
            QuadStep::Slow => {
                slow += 1;
                for line in quad.sl..=quad.el.min(lines) {
                    for sample in quad.ss..=quad.es.min(samples) {
                        map.set(sample, line, transform.inverse_map(sample as f64, line as f64));
                    }
                }
            }
        }
    }
    debug!(fitted, slow, "quad-tree coordinate map complete");
    map
}

fn process_quad(transform: &Transform, config: &QuadTreeConfig, quad: &Quad, map: &mut CoordinateMap) -> QuadStep {
    let small = quad.el - quad.sl < config.end_size || quad.el == quad.sl || quad.es == quad.ss;
    let fallback = if small { QuadStep::Slow } else { QuadStep::Split };

    let corners = [
        (quad.ss, quad.sl),
        (quad.es, quad.sl),
        (quad.ss, quad.el),
        (quad.es, quad.el),
    ];
    let mapped: Vec<Option<(f64, f64)>> = corners
        .iter()
        .map(|&(s, l)| transform.inverse_map(s as f64, l as f64))
        .collect();

    if mapped.iter().all(Option::is_none) {
        // Nothing maps at the corners; only subdivide if something inside does.
        return if small {
            QuadStep::Slow
        } else if crosshair_maps(transform, quad) {
            QuadStep::Split
        } else {
            QuadStep::Done
        };
    }
    let mut input = [(0.0, 0.0); 4];
    for (slot, coord) in input.iter_mut().zip(&mapped) {
        match coord {
            Some(c) => *slot = *c,
            None => return fallback,
        }
    }

    // input = c0*ol + c1*os + c2*ol*os + c3, solved by Cramer's rule.
    let a = Matrix4::from_fn(|i, j| {
        let (os, ol) = (corners[i].0 as f64, corners[i].1 as f64);
        [ol, os, ol * os, 1.0][j]
    });
    let det = a.determinant();
    if det == 0.0 {
        return fallback;
    }
    let solve = |values: [f64; 4]| -> [f64; 4] {
        let mut coef = [0.0; 4];
        for (j, c) in coef.iter_mut().enumerate() {
            let mut b = a;
            for i in 0..4 {
                b[(i, j)] = values[i];
            }
            *c = b.determinant() / det;
        }
        coef
    };
    let samp_coef = solve([input[0].0, input[1].0, input[2].0, input[3].0]);
    let line_coef = solve([input[0].1, input[1].1, input[2].1, input[3].1]);
    let eval = |c: &[f64; 4], os: f64, ol: f64| c[0] * ol + c[1] * os + c[2] * ol * os + c[3];

    let mid_s = (quad.ss + quad.es) as f64 / 2.0;
    let mid_l = (quad.sl + quad.el) as f64 / 2.0;
    let Some((true_s, true_l)) = transform.inverse_map(mid_s, mid_l) else {
        return fallback;
    };
    if (eval(&samp_coef, mid_s, mid_l) - true_s).abs() > config.tolerance
        || (eval(&line_coef, mid_s, mid_l) - true_l).abs() > config.tolerance
    {
        return fallback;
    }

    let (samples, lines) = (map.samples, map.coords.len() / map.samples);
    for line in quad.sl..=quad.el.min(lines) {
        for sample in quad.ss..=quad.es.min(samples) {
            let (os, ol) = (sample as f64, line as f64);
            map.set(sample, line, Some((eval(&samp_coef, os, ol), eval(&line_coef, os, ol))));
        }
    }
    QuadStep::Done
}

/// Probes the quad outline and centre cross every four pixels.
fn crosshair_maps(transform: &Transform, quad: &Quad) -> bool {
    let cs = (quad.ss + quad.es) / 2;
    let cl = (quad.sl + quad.el) / 2;
    let probe_line = |line: usize| {
        (quad.ss..=quad.es)
            .step_by(4)
            .any(|s| transform.inverse_map(s as f64, line as f64).is_some())
    };
    let probe_sample = |sample: usize| {
        (quad.sl..=quad.el)
            .step_by(4)
            .any(|l| transform.inverse_map(sample as f64, l as f64).is_some())
    };
    probe_line(quad.sl)
        || probe_line(quad.el)
        || probe_line(cl)
        || probe_sample(quad.ss)
        || probe_sample(quad.es)
        || probe_sample(cs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::Affine;
    use crate::raster::{is_null, Raster};
    use std::cell::RefCell;

    fn sixteen() -> Raster {
        Raster::from_rows(&[
            vec![1.0, 2.0, 3.0, 4.0],
            vec![5.0, 6.0, 7.0, 8.0],
            vec![9.0, 10.0, 11.0, 12.0],
            vec![13.0, 14.0, 15.0, 16.0],
        ])
    }

    #[test]
    fn identity_nearest_reproduces_input() {
        let input = sixteen();
        let mut output = Raster::default();
        RubberSheet::new(Interpolator::NearestNeighbour).run(
            &input,
            &Transform::Identity { samples: 4, lines: 4 },
            &mut output,
        );
        assert_eq!(output, input);
    }

    #[test]
    fn shifted_output_marks_no_data() {
        let input = sixteen();
        let mut affine = Affine::identity();
        affine.translate(1.0, 0.0);
        let transform = Transform::Affine {
            affine,
            samples: 4,
            lines: 4,
        };
        let mut output = Raster::default();
        RubberSheet::new(Interpolator::Bilinear).run(&input, &transform, &mut output);
        assert_eq!(output.value(2, 1, 1), 1.0);
        assert_eq!(output.value(4, 3, 1), 11.0);
        assert!(is_null(output.value(1, 1, 1)));
        // Bilinear needs the pixel below, which does not exist on the last line.
        assert!(is_null(output.value(2, 4, 1)));
    }

    #[test]
    fn quad_tree_matches_per_pixel_for_affine() {
        let input = Raster::from_fn(60, 50, |s, l| ((s * 7 + l * 13) % 17) as f64 + 0.1 * s as f64);
        let mut affine = Affine::identity();
        affine.rotate(3.0);
        affine.scale(1.1).unwrap();
        affine.translate(-2.5, 1.25);
        let transform = Transform::Affine {
            affine,
            samples: 70,
            lines: 45,
        };
        let mut slow = Raster::default();
        let mut quad = Raster::default();
        let engine = RubberSheet::new(Interpolator::Bilinear);
        engine.run(&input, &transform, &mut slow);
        engine
            .with_mode(GeomMode::QuadTree(QuadTreeConfig {
                start_size: 16,
                end_size: 4,
                tolerance: 0.5,
            }))
            .run(&input, &transform, &mut quad);

        for line in 1..=45 {
            for sample in 1..=70 {
                let (a, b) = (slow.value(sample, line, 1), quad.value(sample, line, 1));
                if is_null(a) {
                    assert!(is_null(b), "({sample}, {line})");
                } else {
                    assert!((a - b).abs() < 1e-6, "({sample}, {line}): {a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn parallel_matches_sequential() {
        let input = Raster::from_fn(32, 32, |s, l| (s * l) as f64);
        let mut affine = Affine::identity();
        affine.rotate(-10.0);
        let transform = Transform::Affine {
            affine,
            samples: 32,
            lines: 32,
        };
        let mut a = Raster::default();
        let mut b = Raster::default();
        let engine = RubberSheet::new(Interpolator::CubicConvolution);
        engine.run(&input, &transform, &mut a);
        engine.with_parallel(true).run(&input, &transform, &mut b);
        for (x, y) in a.band(1).iter().zip(b.band(1)) {
            assert!(x == y || (is_null(*x) && is_null(*y)));
        }
    }

    #[test]
    fn hooks_see_every_band_and_line() {
        let mut input = Raster::new(3, 2, 2);
        for band in 1..=2 {
            for line in 1..=2 {
                for sample in 1..=3 {
                    input.set(sample, line, band, (band * 100 + line * 10 + sample) as f64);
                }
            }
        }
        let bands_seen: RefCell<Vec<usize>> = RefCell::new(Vec::new());
        let progress: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
        let hooks = Hooks {
            band_change: Some(Box::new(|b: usize| bands_seen.borrow_mut().push(b))),
            progress: Some(Box::new(|done: usize, total: usize| {
                progress.borrow_mut().push((done, total))
            })),
        };
        let mut output = Raster::default();
        RubberSheet::new(Interpolator::NearestNeighbour).run_with_hooks(
            &input,
            &Transform::Identity { samples: 3, lines: 2 },
            &mut output,
            hooks,
        );
        assert_eq!(output, input);
        assert_eq!(*bands_seen.borrow(), vec![1, 2]);
        assert_eq!(*progress.borrow(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    }
}
