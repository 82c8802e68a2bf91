//! Measurement noise models in square-root ("whitening") form.
//!
//! A noise model represents the inverse observation covariance. Whitening
//! maps a residual or Jacobian block into a space where the measurement
//! noise has unit covariance, which is the space in which Gauss-Newton
//! normal equations are accumulated.
//!
//! Only diagonal covariances are representable: the closed variant set is
//! identity scaling ([`NoiseModel::Unit`]), per-component scaling
//! ([`NoiseModel::Diagonal`]), and zero-variance equality constraints
//! ([`NoiseModel::Constrained`]). Routines that perform unguarded
//! information-matrix rank updates must reject constrained models, because
//! zero-variance rows have no finite precision to bake into a rank update.

use nalgebra::{DMatrix, DVector};

use crate::error::{SbaError, SbaResult};

/// Square-root information form of a diagonal measurement covariance.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseModel {
    /// Identity whitening; applying it is a no-op.
    Unit { dim: usize },
    /// Per-component reciprocal standard deviations.
    Diagonal { inv_sigmas: DVector<f64> },
    /// One or more components have zero variance, encoding a hard equality
    /// constraint. Entries of `sigmas` equal to zero mark the constrained
    /// rows; the remaining rows whiten like a diagonal model.
    Constrained { sigmas: DVector<f64> },
}

impl NoiseModel {
    /// Identity model of the given dimension.
    pub fn unit(dim: usize) -> Self {
        NoiseModel::Unit { dim }
    }

    /// Diagonal model from per-component standard deviations.
    ///
    /// All sigmas must be strictly positive; a zero sigma is an equality
    /// constraint and must be declared via [`NoiseModel::constrained`].
    /// All-ones sigmas collapse to the unit model.
    pub fn from_sigmas(sigmas: &[f64]) -> SbaResult<Self> {
        if sigmas.iter().any(|&s| s <= 0.0) {
            return Err(SbaError::InvalidInput(
                "diagonal noise model requires strictly positive sigmas; \
                 use NoiseModel::constrained for zero-variance components"
                    .to_string(),
            ));
        }
        if sigmas.iter().all(|&s| s == 1.0) {
            return Ok(NoiseModel::Unit { dim: sigmas.len() });
        }
        Ok(NoiseModel::Diagonal {
            inv_sigmas: DVector::from_iterator(sigmas.len(), sigmas.iter().map(|s| 1.0 / s)),
        })
    }

    /// Isotropic model: the same standard deviation on every component.
    pub fn isotropic(dim: usize, sigma: f64) -> SbaResult<Self> {
        Self::from_sigmas(&vec![sigma; dim])
    }

    /// Constrained model: zero entries in `sigmas` mark zero-variance
    /// (hard equality) components, positive entries behave like a diagonal
    /// model.
    pub fn constrained(sigmas: &[f64]) -> SbaResult<Self> {
        if sigmas.iter().any(|&s| s < 0.0) {
            return Err(SbaError::InvalidInput(
                "noise model sigmas must be non-negative".to_string(),
            ));
        }
        Ok(NoiseModel::Constrained {
            sigmas: DVector::from_column_slice(sigmas),
        })
    }

    /// Residual dimension this model applies to.
    pub fn dim(&self) -> usize {
        match self {
            NoiseModel::Unit { dim } => *dim,
            NoiseModel::Diagonal { inv_sigmas } => inv_sigmas.len(),
            NoiseModel::Constrained { sigmas } => sigmas.len(),
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, NoiseModel::Unit { .. })
    }

    pub fn is_constrained(&self) -> bool {
        matches!(self, NoiseModel::Constrained { .. })
    }

    /// Strips covariance scaling, keeping only the equality-constraint
    /// structure. Used when a constrained model must survive an algebraic
    /// transformation that cannot itself carry scaling: the transformed
    /// factor stays marked as constrained without double-applying sigmas.
    pub fn unit_variant(&self) -> NoiseModel {
        match self {
            NoiseModel::Constrained { sigmas } => NoiseModel::Constrained {
                sigmas: sigmas.map(|s| if s == 0.0 { 0.0 } else { 1.0 }),
            },
            _ => NoiseModel::Unit { dim: self.dim() },
        }
    }

    /// Row scale applied by whitening. Constrained rows pass through
    /// unscaled; their infinite precision is handled by dedicated
    /// constrained elimination outside this layer.
    fn scale(&self, row: usize) -> f64 {
        match self {
            NoiseModel::Unit { .. } => 1.0,
            NoiseModel::Diagonal { inv_sigmas } => inv_sigmas[row],
            NoiseModel::Constrained { sigmas } => {
                if sigmas[row] == 0.0 {
                    1.0
                } else {
                    1.0 / sigmas[row]
                }
            }
        }
    }

    fn check_dim(&self, actual: usize) -> SbaResult<()> {
        if actual != self.dim() {
            return Err(SbaError::DimensionMismatch {
                expected: self.dim(),
                actual,
            });
        }
        Ok(())
    }

    /// Whiten a residual vector.
    pub fn whiten_vector(&self, v: &DVector<f64>) -> SbaResult<DVector<f64>> {
        self.check_dim(v.len())?;
        Ok(DVector::from_iterator(
            v.len(),
            v.iter().enumerate().map(|(r, x)| self.scale(r) * x),
        ))
    }

    /// Whiten a residual vector in place. Used on the fast paths that apply
    /// the transform twice to obtain full precision scaling.
    pub fn whiten_vector_in_place(&self, v: &mut DVector<f64>) -> SbaResult<()> {
        self.check_dim(v.len())?;
        for r in 0..v.len() {
            v[r] *= self.scale(r);
        }
        Ok(())
    }

    /// Whiten a Jacobian block (row scaling).
    pub fn whiten_matrix(&self, m: &DMatrix<f64>) -> SbaResult<DMatrix<f64>> {
        self.check_dim(m.nrows())?;
        let mut out = m.clone();
        for r in 0..out.nrows() {
            let s = self.scale(r);
            for c in 0..out.ncols() {
                out[(r, c)] *= s;
            }
        }
        Ok(out)
    }
}
