//! Error kinds raised by the warping and registration core.

use thiserror::Error;

/// Errors produced by the numeric and geometric components of the crate.
///
/// `OutOfDomain` and `Singular` are local conditions: the rubber-sheet
/// engine turns the former into a no-data pixel and the Gruen matcher turns
/// the latter into a non-converged result. `Underdetermined`,
/// `NotInvertible`, `Empty`, `InvalidChip` and `InsufficientPoints` are
/// structural and end the current driver invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoregError {
    #[error("underdetermined system: {rows} usable rows for {coefficients} coefficients")]
    Underdetermined { rows: usize, coefficients: usize },

    #[error("affine matrix is not invertible")]
    NotInvertible,

    #[error("coordinate ({sample}, {line}) is outside the interpolator domain")]
    OutOfDomain { sample: f64, line: f64 },

    #[error("matcher did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("normal matrix is singular at iteration {iteration}")]
    Singular { iteration: usize },

    #[error("only {found} valid points, {required} required")]
    InsufficientPoints { found: usize, required: usize },

    #[error("invalid chip dimensions {samples}x{lines}")]
    InvalidChip { samples: usize, lines: usize },

    #[error("tie-point source has no active records")]
    Empty,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoregError {
    /// Returns `true` for the kinds the engine recovers from locally.
    pub fn is_local(&self) -> bool {
        matches!(self, CoregError::OutOfDomain { .. } | CoregError::Singular { .. })
    }

    /// Returns `true` for the kinds that abort a driver invocation.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoregError::Underdetermined { .. }
                | CoregError::NotInvertible
                | CoregError::Empty
                | CoregError::InvalidChip { .. }
                | CoregError::InsufficientPoints { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoregError>;
