/// The family a [`BasisFunction`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisKind {
    /// Bivariate polynomial in `(x, y)` of the given total degree.
    Polynomial { degree: usize },
}

/// A finite ordered set of terms over two variables, plus the coefficient
/// vector produced by a least-squares fit.
///
/// Terms of the degree-`d` polynomial are generated row by row: row 0 is
/// `{1}`, and row `i` multiplies every term of row `i-1` by `x` and then the
/// last term of row `i-1` by `y`. For degree 2 this yields
///
/// ```text
///   1, x, y, x², xy, y²
/// ```
///
/// # Examples
/// ```
/// # use coreg::basis_function::BasisFunction;
/// let basis = BasisFunction::polynomial(2);
/// assert_eq!(basis.expand(&[2.0, 3.0]), vec![1.0, 2.0, 3.0, 4.0, 6.0, 9.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BasisFunction {
    kind: BasisKind,
    coefficients: Vec<f64>,
}

impl BasisFunction {
    /// Creates a bivariate polynomial basis of total degree `degree` with all
    /// coefficients set to zero.
    pub fn polynomial(degree: usize) -> Self {
        let terms = (degree + 1) * (degree + 2) / 2;
        BasisFunction {
            kind: BasisKind::Polynomial { degree },
            coefficients: vec![0.0; terms],
        }
    }

    /// The affine basis `{1, x, y}`, i.e. a degree-1 polynomial.
    pub fn affine() -> Self {
        Self::polynomial(1)
    }

    pub fn kind(&self) -> BasisKind {
        self.kind
    }

    pub fn name(&self) -> String {
        match self.kind {
            BasisKind::Polynomial { degree: 1 } => "Affine".to_string(),
            BasisKind::Polynomial { degree } => format!("PolynomialBivariate({degree})"),
        }
    }

    /// Number of input variables the basis expects.
    pub fn variables(&self) -> usize {
        2
    }

    /// Number of terms (and coefficients).
    pub fn terms(&self) -> usize {
        self.coefficients.len()
    }

    /// Expands `vars = [x, y]` into the term vector.
    ///
    /// # Panics
    /// Panics if `vars` does not hold exactly two values.
    pub fn expand(&self, vars: &[f64]) -> Vec<f64> {
        assert_eq!(
            vars.len(),
            self.variables(),
            "{} expects {} variables",
            self.name(),
            self.variables()
        );
        let (x, y) = (vars[0], vars[1]);
        let BasisKind::Polynomial { degree } = self.kind;

        let mut terms = Vec::with_capacity(self.terms());
        terms.push(1.0);
        let mut row_start = 0;
        for _ in 0..degree {
            let row_end = terms.len();
            for k in row_start..row_end {
                terms.push(terms[k] * x);
            }
            terms.push(terms[row_end - 1] * y);
            row_start = row_end;
        }
        terms
    }

    pub fn coefficient(&self, i: usize) -> f64 {
        self.coefficients[i]
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Replaces the coefficient vector.
    ///
    /// # Panics
    /// Panics if the length does not match [`terms`](Self::terms).
    pub fn set_coefficients(&mut self, coefficients: &[f64]) {
        assert_eq!(coefficients.len(), self.terms());
        self.coefficients.copy_from_slice(coefficients);
    }

    /// Expands `vars` and takes the dot product with the coefficients.
    ///
    /// # Panics
    /// Panics if `vars` does not hold exactly two values.
    pub fn evaluate(&self, vars: &[f64]) -> f64 {
        self.expand(vars)
            .iter()
            .zip(&self.coefficients)
            .map(|(t, c)| t * c)
            .sum()
    }
}
