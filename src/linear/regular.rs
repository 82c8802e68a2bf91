//! Fixed-block-width linear factors with matrix-free Hessian operations.
//!
//! When every variable shares one block dimension `D` (all-landmark or
//! all-pose subproblems), per-variable blocks can be addressed by
//! `key × D` offsets into a caller-owned buffer, with no per-call size
//! lookups and no allocation beyond a single work vector. Iterative solvers
//! use these products to apply `αAᵀAx` without ever materializing the
//! assembled information matrix.

use std::sync::Arc;

use nalgebra::{Const, DMatrix, DVector, Dyn, OMatrix, OVector};

use crate::error::{SbaError, SbaResult};
use crate::linear::block_factor::BlockLinearFactor;
use crate::noise::NoiseModel;
use crate::values::Key;

/// Jacobian block with statically known width.
pub type RegularBlock<const D: usize> = OMatrix<f64, Dyn, Const<D>>;

/// Per-key `(offset, width)` table describing an external storage layout.
///
/// Decouples a factor's internal fixed block width from the caller's
/// buffer layout: offsets are arbitrary, widths are checked against the
/// factor's `D` on use. Indexed by [`Key`].
#[derive(Debug, Clone, Default)]
pub struct VariableLayout {
    entries: Vec<(usize, usize)>,
}

impl VariableLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contiguous layout: key `k` starts at `sum(widths[..k])`.
    pub fn from_widths(widths: &[usize]) -> Self {
        let mut entries = Vec::with_capacity(widths.len());
        let mut offset = 0;
        for &w in widths {
            entries.push((offset, w));
            offset += w;
        }
        Self { entries }
    }

    /// Append the entry for the next key.
    pub fn push(&mut self, offset: usize, width: usize) {
        self.entries.push((offset, width));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(offset, width)` of a key; unknown keys are rejected.
    pub fn entry(&self, key: Key) -> SbaResult<(usize, usize)> {
        self.entries
            .get(key)
            .copied()
            .ok_or(SbaError::UnknownKey(key))
    }
}

/// A [`BlockLinearFactor`] whose variable blocks all share the statically
/// known width `D`, laid out for offset addressing.
#[derive(Debug, Clone)]
pub struct RegularBlockFactor<const D: usize> {
    keys: Vec<Key>,
    blocks: Vec<RegularBlock<D>>,
    rhs: DVector<f64>,
    noise: Option<Arc<NoiseModel>>,
}

impl<const D: usize> RegularBlockFactor<D> {
    /// Assemble from per-variable fixed-width blocks. Keys must be
    /// distinct; every block must have `rhs.len()` rows; a noise model,
    /// when present, must match that dimension.
    pub fn new(
        keys: Vec<Key>,
        blocks: Vec<RegularBlock<D>>,
        rhs: DVector<f64>,
        noise: Option<Arc<NoiseModel>>,
    ) -> SbaResult<Self> {
        if keys.is_empty() {
            return Err(SbaError::InvalidInput(
                "regular factor must involve at least one variable".to_string(),
            ));
        }
        if keys.len() != blocks.len() {
            return Err(SbaError::InvalidInput(format!(
                "{} keys but {} Jacobian blocks",
                keys.len(),
                blocks.len()
            )));
        }
        for (pos, key) in keys.iter().enumerate() {
            if keys[..pos].contains(key) {
                return Err(SbaError::InvalidInput(format!(
                    "duplicate variable key {key} in regular factor"
                )));
            }
        }
        for block in &blocks {
            if block.nrows() != rhs.len() {
                return Err(SbaError::DimensionMismatch {
                    expected: rhs.len(),
                    actual: block.nrows(),
                });
            }
        }
        if let Some(model) = &noise {
            if model.dim() != rhs.len() {
                return Err(SbaError::DimensionMismatch {
                    expected: rhs.len(),
                    actual: model.dim(),
                });
            }
        }
        Ok(Self {
            keys,
            blocks,
            rhs,
            noise,
        })
    }

    /// Checked conversion from a dynamically-sized linear factor; every
    /// block must have width `D`.
    pub fn from_block_factor(factor: &BlockLinearFactor) -> SbaResult<Self> {
        let blocks = factor
            .blocks()
            .iter()
            .map(|a| {
                if a.ncols() != D {
                    return Err(SbaError::DimensionMismatch {
                        expected: D,
                        actual: a.ncols(),
                    });
                }
                Ok(RegularBlock::<D>::from_fn_generic(
                    Dyn(a.nrows()),
                    Const::<D>,
                    |r, c| a[(r, c)],
                ))
            })
            .collect::<SbaResult<Vec<_>>>()?;
        Self::new(
            factor.keys().to_vec(),
            blocks,
            factor.rhs().clone(),
            factor.noise_model().cloned(),
        )
    }

    /// The same factor as a dynamically-sized [`BlockLinearFactor`].
    pub fn as_block_factor(&self) -> SbaResult<BlockLinearFactor> {
        let blocks = self
            .blocks
            .iter()
            .map(|a| DMatrix::from_fn(a.nrows(), D, |r, c| a[(r, c)]))
            .collect();
        BlockLinearFactor::new(
            self.keys.clone(),
            blocks,
            self.rhs.clone(),
            self.noise.clone(),
        )
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn blocks(&self) -> &[RegularBlock<D>] {
        &self.blocks
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    pub fn noise_model(&self) -> Option<&Arc<NoiseModel>> {
        self.noise.as_ref()
    }

    /// Residual dimension.
    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    fn reject_constrained(&self, operation: &str) -> SbaResult<()> {
        if let Some(model) = &self.noise {
            if model.is_constrained() {
                return Err(SbaError::InvalidOperation(format!(
                    "{operation} is unsupported for constrained noise models; \
                     pre-whiten or use constrained elimination"
                )));
            }
        }
        Ok(())
    }

    /// Apply full precision scaling to a residual-space vector: whitening
    /// applied twice in sequence, since a single application maps into the
    /// square-root-precision space while the quadratic form needs 1/sigma^2.
    /// Exact for the diagonal scaling this model set admits.
    fn apply_precision(&self, v: &mut DVector<f64>) -> SbaResult<()> {
        if let Some(model) = &self.noise {
            if !model.is_unit() {
                model.whiten_vector_in_place(v)?;
                model.whiten_vector_in_place(v)?;
            }
        }
        Ok(())
    }

    fn segment<'a>(&self, buf: &'a [f64], offset: usize, key: Key) -> SbaResult<&'a [f64]> {
        buf.get(offset..offset + D).ok_or_else(|| {
            SbaError::InvalidInput(format!(
                "buffer of length {} too short for key {key} at offset {offset}",
                buf.len()
            ))
        })
    }

    fn gather_scale_scatter(
        &self,
        alpha: f64,
        x: &[f64],
        y: &mut [f64],
        offset_of: impl Fn(Key) -> SbaResult<usize>,
    ) -> SbaResult<()> {
        let mut ax = DVector::<f64>::zeros(self.rows());
        for (pos, &key) in self.keys.iter().enumerate() {
            let offset = offset_of(key)?;
            let seg = self.segment(x, offset, key)?;
            let xi = OVector::<f64, Const<D>>::from_column_slice(seg);
            ax += &self.blocks[pos] * xi;
        }

        self.apply_precision(&mut ax)?;
        ax *= alpha;

        for (pos, &key) in self.keys.iter().enumerate() {
            let offset = offset_of(key)?;
            if y.len() < offset + D {
                return Err(SbaError::InvalidInput(format!(
                    "output buffer of length {} too short for key {key} at offset {offset}",
                    y.len()
                )));
            }
            let contribution = self.blocks[pos].tr_mul(&ax);
            for k in 0..D {
                y[offset + k] += contribution[k];
            }
        }
        Ok(())
    }

    /// `y += alpha * Aᵀ A x`, with `x` and `y` addressed by `key × D`
    /// offsets. Constrained models are rejected; non-unit models contribute
    /// their full precision via double whitening.
    pub fn multiply_hessian_add(&self, alpha: f64, x: &[f64], y: &mut [f64]) -> SbaResult<()> {
        self.reject_constrained("multiply_hessian_add")?;
        self.gather_scale_scatter(alpha, x, y, |key| Ok(key * D))
    }

    /// [`multiply_hessian_add`](Self::multiply_hessian_add) against an
    /// external storage layout. Every touched entry's width must equal `D`.
    pub fn multiply_hessian_add_with_layout(
        &self,
        alpha: f64,
        x: &[f64],
        y: &mut [f64],
        layout: &VariableLayout,
    ) -> SbaResult<()> {
        self.reject_constrained("multiply_hessian_add")?;
        self.gather_scale_scatter(alpha, x, y, |key| {
            let (offset, width) = layout.entry(key)?;
            if width != D {
                return Err(SbaError::DimensionMismatch {
                    expected: D,
                    actual: width,
                });
            }
            Ok(offset)
        })
    }

    /// Per-variable diagonal of `AᵀA`: the column-wise squared norms of each
    /// (whitened) Jacobian block. A cheap preconditioner, not the true
    /// diagonal of the assembled matrix when cross terms exist.
    pub fn hessian_diagonal(&self) -> SbaResult<Vec<(Key, OVector<f64, Const<D>>)>> {
        self.reject_constrained("hessian_diagonal")?;
        let weights = self.row_weights()?;
        let mut out = Vec::with_capacity(self.keys.len());
        for (pos, &key) in self.keys.iter().enumerate() {
            let mut dj = OVector::<f64, Const<D>>::zeros();
            for k in 0..D {
                let mut sum = 0.0;
                for r in 0..self.rows() {
                    let v = weights[r] * self.blocks[pos][(r, k)];
                    sum += v * v;
                }
                dj[k] = sum;
            }
            out.push((key, dj));
        }
        Ok(out)
    }

    /// Raw version of [`hessian_diagonal`](Self::hessian_diagonal):
    /// scatter-adds into `d` at `key × D` offsets.
    pub fn hessian_diagonal_into(&self, d: &mut [f64]) -> SbaResult<()> {
        for (key, dj) in self.hessian_diagonal()? {
            let offset = key * D;
            if d.len() < offset + D {
                return Err(SbaError::InvalidInput(format!(
                    "diagonal buffer of length {} too short for key {key}",
                    d.len()
                )));
            }
            for k in 0..D {
                d[offset + k] += dj[k];
            }
        }
        Ok(())
    }

    /// Gradient of the factor's quadratic form `½‖W(Ax − b)‖²` at `x = 0`:
    /// scatter-adds `−AᵀWᵀWb` into `g` at `key × D` offsets. Unsupported
    /// for constrained models (rejected, never a silent wrong value).
    pub fn gradient_at_zero_into(&self, g: &mut [f64]) -> SbaResult<()> {
        self.reject_constrained("gradient_at_zero")?;
        let mut e = self.rhs.clone();
        self.apply_precision(&mut e)?;
        for (pos, &key) in self.keys.iter().enumerate() {
            let offset = key * D;
            if g.len() < offset + D {
                return Err(SbaError::InvalidInput(format!(
                    "gradient buffer of length {} too short for key {key}",
                    g.len()
                )));
            }
            let contribution = self.blocks[pos].tr_mul(&e);
            for k in 0..D {
                g[offset + k] -= contribution[k];
            }
        }
        Ok(())
    }

    /// Per-row whitening scales; identity when no model is attached.
    fn row_weights(&self) -> SbaResult<DVector<f64>> {
        let ones = DVector::from_element(self.rows(), 1.0);
        match &self.noise {
            Some(model) if !model.is_unit() => model.whiten_vector(&ones),
            _ => Ok(ones),
        }
    }
}
