//! Tie-point records pairing an input coordinate with its output coordinate.

use serde::{Deserialize, Serialize};

/// A correspondence between `(in_sample, in_line)` in the input raster and
/// `(out_sample, out_line)` in the output (reference) raster.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TiePoint {
    pub in_sample: f64,
    pub in_line: f64,
    pub out_sample: f64,
    pub out_line: f64,
    /// Ignored records are skipped by the driver.
    #[serde(default)]
    pub ignored: bool,
}

impl TiePoint {
    /// Create a new active tie point
    pub fn new(in_sample: f64, in_line: f64, out_sample: f64, out_line: f64) -> Self {
        TiePoint {
            in_sample,
            in_line,
            out_sample,
            out_line,
            ignored: false,
        }
    }

    /// Returns a copy flagged as ignored
    pub fn ignore(self) -> Self {
        TiePoint {
            ignored: true,
            ..self
        }
    }

    /// Input coordinate as `(sample, line)`
    pub fn input(&self) -> (f64, f64) {
        (self.in_sample, self.in_line)
    }

    /// Output coordinate as `(sample, line)`
    pub fn output(&self) -> (f64, f64) {
        (self.out_sample, self.out_line)
    }

    /// Returns a copy with the input coordinate replaced
    pub fn with_input(self, sample: f64, line: f64) -> Self {
        TiePoint {
            in_sample: sample,
            in_line: line,
            ..self
        }
    }
}

/// An ordered supply of tie points, e.g. a control network or a reseau
/// detector.
pub trait TiePointSource {
    fn tie_points(&self) -> Vec<TiePoint>;

    /// Active records paired with their position in [`tie_points`](Self::tie_points).
    fn active(&self) -> Vec<(usize, TiePoint)> {
        self.tie_points()
            .into_iter()
            .enumerate()
            .filter(|(_, p)| !p.ignored)
            .collect()
    }
}

impl TiePointSource for [TiePoint] {
    fn tie_points(&self) -> Vec<TiePoint> {
        self.to_vec()
    }
}

impl TiePointSource for Vec<TiePoint> {
    fn tie_points(&self) -> Vec<TiePoint> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_skips_ignored_and_keeps_indices() {
        let points = vec![
            TiePoint::new(1.0, 1.0, 1.0, 1.0),
            TiePoint::new(2.0, 2.0, 2.0, 2.0).ignore(),
            TiePoint::new(3.0, 3.0, 4.0, 4.0),
        ];
        let active = points.active();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].0, 0);
        assert_eq!(active[1].0, 2);
        assert_eq!(active[1].1.output(), (4.0, 4.0));
    }

    #[test]
    fn ignored_defaults_to_false_when_deserialised() {
        let p: TiePoint = serde_json::from_str(
            r#"{"in_sample": 1.5, "in_line": 2.0, "out_sample": 3.0, "out_line": 4.0}"#,
        )
        .unwrap();
        assert!(!p.ignored);
        assert_eq!(p.with_input(9.0, 8.0).input(), (9.0, 8.0));
    }
}
