use serde::{Deserialize, Serialize};

/// Numeric thresholds shared by the solvers.
///
/// Passed explicitly to [`LeastSquares`](crate::least_squares::LeastSquares)
/// and [`Affine`](crate::affine::Affine) instead of living in process-wide
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericsContext {
    /// Singular values below `rank_tolerance * max_singular_value` are treated as zero
    /// when solving least-squares problems.
    pub rank_tolerance: f64,

    /// Singular values of an affine forward matrix at or below this relative
    /// threshold make the matrix non-invertible.
    pub singular_tolerance: f64,
}

impl Default for NumericsContext {
    fn default() -> Self {
        NumericsContext {
            rank_tolerance: 1e-12,
            singular_tolerance: 1e-14,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let ctx: NumericsContext = serde_json::from_str(r#"{"rank_tolerance": 1e-9}"#).unwrap();
        assert_eq!(ctx.rank_tolerance, 1e-9);
        assert_eq!(ctx.singular_tolerance, NumericsContext::default().singular_tolerance);
    }
}
