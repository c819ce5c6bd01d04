use crate::affine::Affine;
use crate::warp_transform::WarpTransform;

/// The inverse mappings the rubber-sheet engine can be driven by.
///
/// Every variant answers "which input coordinate feeds this output pixel".
#[derive(Debug)]
pub enum Transform {
    /// Output and input coordinates coincide.
    Identity { samples: usize, lines: usize },
    /// The forward matrix maps input to output; queries go through the inverse.
    Affine {
        affine: Affine,
        samples: usize,
        lines: usize,
    },
    Warp(WarpTransform),
}

impl Transform {
    /// Returns the input `(sample, line)` for an output coordinate, or `None`
    /// when the transform cannot answer.
    pub fn inverse_map(&self, out_sample: f64, out_line: f64) -> Option<(f64, f64)> {
        match self {
            Transform::Identity { .. } => Some((out_sample, out_line)),
            Transform::Affine { affine, .. } => Some(affine.compute_inverse(out_sample, out_line)),
            Transform::Warp(warp) => warp.inverse_map(out_sample, out_line),
        }
    }

    pub fn output_samples(&self) -> usize {
        match self {
            Transform::Identity { samples, .. } | Transform::Affine { samples, .. } => *samples,
            Transform::Warp(warp) => warp.output_samples(),
        }
    }

    pub fn output_lines(&self) -> usize {
        match self {
            Transform::Identity { lines, .. } | Transform::Affine { lines, .. } => *lines,
            Transform::Warp(warp) => warp.output_lines(),
        }
    }
}

impl From<WarpTransform> for Transform {
    fn from(warp: WarpTransform) -> Self {
        Transform::Warp(warp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_variant_uses_inverse() {
        let mut affine = Affine::identity();
        affine.translate(3.0, -2.0);
        let t = Transform::Affine {
            affine,
            samples: 10,
            lines: 12,
        };
        assert_eq!(t.inverse_map(5.0, 5.0), Some((2.0, 7.0)));
        assert_eq!((t.output_samples(), t.output_lines()), (10, 12));
    }

    #[test]
    fn identity_passes_through() {
        let t = Transform::Identity { samples: 4, lines: 4 };
        assert_eq!(t.inverse_map(1.5, 2.5), Some((1.5, 2.5)));
    }
}
