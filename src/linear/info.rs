//! Symmetric block information matrix for Gauss-Newton normal equations.
//!
//! The matrix is indexed by slot (see
//! [`SlotAssignment`](crate::linear::SlotAssignment)); block `(i, j)` for
//! `i <= j` holds a dense `dim(i) × dim(j)` matrix, and a trailing 1-dim
//! "bias" block carries the right-hand side and the squared residual norm.
//! Only the upper triangle is authoritative; [`full_matrix`] mirrors it
//! when a dense symmetric copy is needed.
//!
//! Accumulation is purely additive, so factor updates commute (up to
//! floating-point summation order) and per-worker partial matrices can be
//! reduced with [`merge`].
//!
//! [`full_matrix`]: BlockInfoMatrix::full_matrix
//! [`merge`]: BlockInfoMatrix::merge

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DMatrix;

use crate::error::{SbaError, SbaResult};

/// Symmetric block matrix over variable slots plus a trailing bias block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfoMatrix {
    /// Per-block dimensions, including the trailing bias block (dim 1).
    dims: Vec<usize>,
    /// Row/column offset of each block; `offsets[i + 1] - offsets[i] == dims[i]`.
    offsets: Vec<usize>,
    /// Dense storage; only the upper triangle is written.
    storage: DMatrix<f64>,
}

impl BlockInfoMatrix {
    /// Zero-initialized accumulator for the given per-variable block
    /// dimensions. The trailing 1-dim bias block is appended internally.
    pub fn new(variable_dims: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(variable_dims.len() + 1);
        dims.extend_from_slice(variable_dims);
        dims.push(1);

        let mut offsets = Vec::with_capacity(dims.len() + 1);
        let mut total = 0;
        for &d in &dims {
            offsets.push(total);
            total += d;
        }
        offsets.push(total);

        Self {
            dims,
            offsets,
            storage: DMatrix::zeros(total, total),
        }
    }

    /// Number of blocks along one side, bias block included.
    pub fn num_blocks(&self) -> usize {
        self.dims.len()
    }

    /// Index of the trailing bias block.
    pub fn bias_index(&self) -> usize {
        self.dims.len() - 1
    }

    pub fn block_dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Row/column offset of block `i` in the assembled matrix.
    pub fn offset_of(&self, i: usize) -> usize {
        self.offsets[i]
    }

    /// Total scalar dimension, bias column included.
    pub fn total_dim(&self) -> usize {
        self.storage.nrows()
    }

    fn check_block_index(&self, i: usize) -> SbaResult<()> {
        if i >= self.dims.len() {
            return Err(SbaError::InvalidInput(format!(
                "block index {i} out of range for {} blocks",
                self.dims.len()
            )));
        }
        Ok(())
    }

    /// Copy of block `(i, j)`. Diagonal blocks are returned symmetrized;
    /// `i > j` returns the transpose of the stored upper-triangle block.
    pub fn block(&self, i: usize, j: usize) -> SbaResult<DMatrix<f64>> {
        self.check_block_index(i)?;
        self.check_block_index(j)?;
        if i > j {
            return Ok(self.block(j, i)?.transpose());
        }
        let mut out = self
            .storage
            .view((self.offsets[i], self.offsets[j]), (self.dims[i], self.dims[j]))
            .into_owned();
        if i == j {
            for r in 0..out.nrows() {
                for c in 0..r {
                    out[(r, c)] = out[(c, r)];
                }
            }
        }
        Ok(out)
    }

    /// Add `m` into block `(i, j)`.
    ///
    /// Off-diagonal blocks must be addressed in canonical (lower slot,
    /// higher slot) order. For diagonal blocks `m` must be symmetric; only
    /// its upper triangle is folded in.
    pub fn add_block(&mut self, i: usize, j: usize, m: &DMatrix<f64>) -> SbaResult<()> {
        self.check_block_index(i)?;
        self.check_block_index(j)?;
        if i > j {
            return Err(SbaError::InvalidInput(format!(
                "off-diagonal block ({i}, {j}) must be addressed as (lower, higher)"
            )));
        }
        if m.nrows() != self.dims[i] {
            return Err(SbaError::DimensionMismatch {
                expected: self.dims[i],
                actual: m.nrows(),
            });
        }
        if m.ncols() != self.dims[j] {
            return Err(SbaError::DimensionMismatch {
                expected: self.dims[j],
                actual: m.ncols(),
            });
        }

        let (row0, col0) = (self.offsets[i], self.offsets[j]);
        if i == j {
            for r in 0..m.nrows() {
                for c in r..m.ncols() {
                    self.storage[(row0 + r, col0 + c)] += m[(r, c)];
                }
            }
        } else {
            for r in 0..m.nrows() {
                for c in 0..m.ncols() {
                    self.storage[(row0 + r, col0 + c)] += m[(r, c)];
                }
            }
        }
        Ok(())
    }

    /// Symmetric rank update: add `a^T a` to diagonal block `i`.
    pub fn rank_update(&mut self, i: usize, a: &DMatrix<f64>) -> SbaResult<()> {
        self.check_block_index(i)?;
        if a.ncols() != self.dims[i] {
            return Err(SbaError::DimensionMismatch {
                expected: self.dims[i],
                actual: a.ncols(),
            });
        }
        let ata = a.tr_mul(a);
        self.add_block(i, i, &ata)
    }

    /// Block-wise addition of another accumulator with identical structure.
    /// This is the reduction step for per-worker partial accumulators.
    pub fn merge(&mut self, other: &BlockInfoMatrix) -> SbaResult<()> {
        if self.dims != other.dims {
            return Err(SbaError::DimensionMismatch {
                expected: self.total_dim(),
                actual: other.total_dim(),
            });
        }
        self.storage += &other.storage;
        Ok(())
    }

    /// Dense symmetric copy: the upper triangle mirrored onto the lower.
    pub fn full_matrix(&self) -> DMatrix<f64> {
        let mut full = self.storage.clone();
        for r in 0..full.nrows() {
            for c in 0..r {
                full[(r, c)] = full[(c, r)];
            }
        }
        full
    }

    /// Export the symmetrized matrix as a sparse column-major matrix for a
    /// downstream direct solver.
    pub fn to_sparse(&self) -> SbaResult<SparseColMat<usize, f64>> {
        let full = self.full_matrix();
        let n = full.nrows();
        let mut triplets = Vec::new();
        for c in 0..n {
            for r in 0..n {
                let v = full[(r, c)];
                if v != 0.0 {
                    triplets.push(Triplet::new(r, c, v));
                }
            }
        }
        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| SbaError::LinearAlgebra(format!("failed to create sparse matrix: {e:?}")))
    }
}
