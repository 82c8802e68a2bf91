//! Linearized measurement factors in block-Jacobian form.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{SbaError, SbaResult};
use crate::linear::info::BlockInfoMatrix;
use crate::linear::slots::SlotAssignment;
use crate::noise::NoiseModel;
use crate::values::Key;

/// The linearized output of one measurement factor: a dense Jacobian block
/// per variable and a residual vector `b` (already negated, so the linear
/// system solves for a correcting step), with an optional noise model.
///
/// A `None` model means the blocks are already whitened. Linearization only
/// ever attaches the unit variant of a constrained model; anything else is
/// baked into the blocks.
#[derive(Debug, Clone)]
pub struct BlockLinearFactor {
    keys: Vec<Key>,
    blocks: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
    noise: Option<Arc<NoiseModel>>,
}

impl BlockLinearFactor {
    /// Assemble a factor from per-variable blocks and a right-hand side.
    ///
    /// Every block must have `rhs.len()` rows; a noise model, when present,
    /// must match that dimension. Keys must be distinct.
    pub fn new(
        keys: Vec<Key>,
        blocks: Vec<DMatrix<f64>>,
        rhs: DVector<f64>,
        noise: Option<Arc<NoiseModel>>,
    ) -> SbaResult<Self> {
        if keys.is_empty() {
            return Err(SbaError::InvalidInput(
                "linear factor must involve at least one variable".to_string(),
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
                    "duplicate variable key {key} in linear factor"
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

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn num_variables(&self) -> usize {
        self.keys.len()
    }

    /// Jacobian block of the `pos`-th variable in the key tuple.
    pub fn block(&self, pos: usize) -> &DMatrix<f64> {
        &self.blocks[pos]
    }

    pub fn blocks(&self) -> &[DMatrix<f64>] {
        &self.blocks
    }

    /// Right-hand side `b = -error`, whitened when a model was applied.
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

    /// Whole-factor whitening: an equivalent factor with no model attached.
    ///
    /// Constrained models cannot be baked into blocks this way (their
    /// zero-variance rows have no finite precision) and are rejected.
    pub fn whitened(&self) -> SbaResult<BlockLinearFactor> {
        let Some(model) = &self.noise else {
            return Ok(self.clone());
        };
        if model.is_constrained() {
            return Err(SbaError::InvalidOperation(
                "cannot whiten a linear factor with a constrained noise model".to_string(),
            ));
        }
        if model.is_unit() {
            let mut out = self.clone();
            out.noise = None;
            return Ok(out);
        }
        let blocks = self
            .blocks
            .iter()
            .map(|a| model.whiten_matrix(a))
            .collect::<SbaResult<Vec<_>>>()?;
        let rhs = model.whiten_vector(&self.rhs)?;
        Ok(Self {
            keys: self.keys.clone(),
            blocks,
            rhs,
            noise: None,
        })
    }

    /// Fold this factor's quadratic form into the accumulator:
    ///
    /// - `A_i^T A_j` into block `(s_i, s_j)` for every unordered variable
    ///   pair, addressed in canonical (lower slot, higher slot) order,
    /// - `A_i^T b` into block `(s_i, bias)`,
    /// - `b^T b` into the scalar bias block.
    ///
    /// A non-unit model is whitened away first; a constrained model on this
    /// path is a contract violation and is rejected rather than attempted.
    pub fn update_hessian(
        &self,
        slots: &SlotAssignment,
        info: &mut BlockInfoMatrix,
    ) -> SbaResult<()> {
        if let Some(model) = &self.noise {
            if !model.is_unit() {
                if model.is_constrained() {
                    return Err(SbaError::InvalidOperation(
                        "cannot update information matrix with a constrained noise model"
                            .to_string(),
                    ));
                }
                return self.whitened()?.update_hessian(slots, info);
            }
        }

        let slot_of = self
            .keys
            .iter()
            .map(|&k| slots.slot(k).ok_or(SbaError::UnknownKey(k)))
            .collect::<SbaResult<Vec<_>>>()?;
        let bias = info.bias_index();

        for i in 0..self.keys.len() {
            info.rank_update(slot_of[i], &self.blocks[i])?;
            for j in (i + 1)..self.keys.len() {
                let (si, sj) = (slot_of[i], slot_of[j]);
                if si <= sj {
                    info.add_block(si, sj, &self.blocks[i].tr_mul(&self.blocks[j]))?;
                } else {
                    info.add_block(sj, si, &self.blocks[j].tr_mul(&self.blocks[i]))?;
                }
            }
            let atb = self.blocks[i].tr_mul(&self.rhs);
            let atb = DMatrix::from_column_slice(atb.len(), 1, atb.as_slice());
            info.add_block(slot_of[i], bias, &atb)?;
        }

        let btb = DMatrix::from_element(1, 1, self.rhs.norm_squared());
        info.add_block(bias, bias, &btb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn unit_blocks_factor() -> BlockLinearFactor {
        // The binary reference scenario: camera block 2x6, landmark block
        // 2x3, identity-like entries, b = (0.1, -0.2).
        let mut a1 = DMatrix::zeros(2, 6);
        a1[(0, 0)] = 1.0;
        a1[(1, 1)] = 1.0;
        let mut a2 = DMatrix::zeros(2, 3);
        a2[(0, 0)] = 1.0;
        a2[(1, 1)] = 1.0;
        BlockLinearFactor::new(vec![10, 20], vec![a1, a2], dvector![0.1, -0.2], None).unwrap()
    }

    #[test]
    fn test_update_hessian_reference_scenario() {
        let factor = unit_blocks_factor();
        let slots = SlotAssignment::from_keys([10, 20]);
        let mut info = BlockInfoMatrix::new(&[6, 3]);
        factor.update_hessian(&slots, &mut info).unwrap();

        let cam = info.block(0, 0).unwrap();
        assert!((cam[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((cam[(1, 1)] - 1.0).abs() < 1e-12);
        assert!(cam[(2, 2)].abs() < 1e-12);

        let cross = info.block(0, 1).unwrap();
        assert!((cross[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(cross[(1, 0)].abs() < 1e-12);

        let lm = info.block(1, 1).unwrap();
        assert!((lm[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((lm[(1, 1)] - 1.0).abs() < 1e-12);

        let rhs_cam = info.block(0, 2).unwrap();
        assert!((rhs_cam[(0, 0)] - 0.1).abs() < 1e-12);
        assert!((rhs_cam[(1, 0)] - (-0.2)).abs() < 1e-12);

        let bias = info.block(2, 2).unwrap();
        assert!((bias[(0, 0)] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_update_hessian_is_additive_and_order_independent() {
        let f1 = BlockLinearFactor::new(
            vec![1, 2],
            vec![
                DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]),
                DMatrix::from_row_slice(2, 2, &[0.5, -1.0, 2.0, 0.0]),
            ],
            dvector![1.0, -1.0],
            None,
        )
        .unwrap();
        let f2 = BlockLinearFactor::new(
            vec![2, 3],
            vec![
                DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]),
                DMatrix::from_row_slice(2, 2, &[1.0, 1.0, -1.0, 1.0]),
            ],
            dvector![0.25, 0.75],
            None,
        )
        .unwrap();

        let slots = SlotAssignment::from_keys([1, 2, 3]);
        let dims = [2, 2, 2];

        let mut forward = BlockInfoMatrix::new(&dims);
        f1.update_hessian(&slots, &mut forward).unwrap();
        f2.update_hessian(&slots, &mut forward).unwrap();

        let mut reverse = BlockInfoMatrix::new(&dims);
        f2.update_hessian(&slots, &mut reverse).unwrap();
        f1.update_hessian(&slots, &mut reverse).unwrap();

        let a = forward.full_matrix();
        let b = reverse.full_matrix();
        for r in 0..a.nrows() {
            for c in 0..a.ncols() {
                assert!((a[(r, c)] - b[(r, c)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_update_hessian_reversed_slot_order_stays_canonical() {
        // Factor key tuple order disagrees with slot order; the off-diagonal
        // contribution must land in the (lower, higher) block.
        let factor = BlockLinearFactor::new(
            vec![20, 10],
            vec![
                DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
                DMatrix::from_row_slice(1, 2, &[0.0, 2.0]),
            ],
            dvector![1.0],
            None,
        )
        .unwrap();
        // Slot order: 10 -> 0, 20 -> 1.
        let slots = SlotAssignment::from_keys([10, 20]);
        let mut info = BlockInfoMatrix::new(&[2, 2]);
        factor.update_hessian(&slots, &mut info).unwrap();

        // A_{10}^T A_{20} lands in block (0, 1).
        let cross = info.block(0, 1).unwrap();
        assert!((cross[(1, 0)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_update_hessian_whitens_first() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let model = Arc::new(NoiseModel::from_sigmas(&[0.5, 2.0]).unwrap());
        let noisy = BlockLinearFactor::new(
            vec![0],
            vec![a.clone()],
            dvector![1.0, 1.0],
            Some(model.clone()),
        )
        .unwrap();
        let white = BlockLinearFactor::new(
            vec![0],
            vec![model.whiten_matrix(&a).unwrap()],
            model.whiten_vector(&dvector![1.0, 1.0]).unwrap(),
            None,
        )
        .unwrap();

        let slots = SlotAssignment::from_keys([0]);
        let mut from_noisy = BlockInfoMatrix::new(&[2]);
        let mut from_white = BlockInfoMatrix::new(&[2]);
        noisy.update_hessian(&slots, &mut from_noisy).unwrap();
        white.update_hessian(&slots, &mut from_white).unwrap();

        let a = from_noisy.full_matrix();
        let b = from_white.full_matrix();
        for r in 0..a.nrows() {
            for c in 0..a.ncols() {
                assert!((a[(r, c)] - b[(r, c)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_update_hessian_rejects_constrained_model() {
        let model = Arc::new(NoiseModel::constrained(&[0.0, 1.0]).unwrap());
        let factor = BlockLinearFactor::new(
            vec![0],
            vec![DMatrix::zeros(2, 3)],
            dvector![0.0, 0.0],
            Some(model),
        )
        .unwrap();
        let slots = SlotAssignment::from_keys([0]);
        let mut info = BlockInfoMatrix::new(&[3]);
        assert!(matches!(
            factor.update_hessian(&slots, &mut info),
            Err(SbaError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_update_hessian_unknown_key() {
        let factor = BlockLinearFactor::new(
            vec![42],
            vec![DMatrix::zeros(1, 2)],
            dvector![0.0],
            None,
        )
        .unwrap();
        let slots = SlotAssignment::from_keys([0]);
        let mut info = BlockInfoMatrix::new(&[2]);
        assert_eq!(
            factor.update_hessian(&slots, &mut info).unwrap_err(),
            SbaError::UnknownKey(42)
        );
    }

    #[test]
    fn test_degenerate_factor_is_neutral() {
        let zero = BlockLinearFactor::new(
            vec![0, 1],
            vec![DMatrix::zeros(2, 3), DMatrix::zeros(2, 3)],
            dvector![0.0, 0.0],
            None,
        )
        .unwrap();
        let slots = SlotAssignment::from_keys([0, 1]);
        let mut info = BlockInfoMatrix::new(&[3, 3]);
        zero.update_hessian(&slots, &mut info).unwrap();
        assert!(info.full_matrix().norm() == 0.0);
    }

    #[test]
    fn test_constructor_validation() {
        assert!(BlockLinearFactor::new(vec![], vec![], dvector![0.0], None).is_err());
        assert!(BlockLinearFactor::new(
            vec![0, 0],
            vec![DMatrix::zeros(1, 2), DMatrix::zeros(1, 2)],
            dvector![0.0],
            None
        )
        .is_err());
        assert!(BlockLinearFactor::new(
            vec![0],
            vec![DMatrix::zeros(2, 2)],
            dvector![0.0],
            None
        )
        .is_err());
        assert!(BlockLinearFactor::new(
            vec![0],
            vec![DMatrix::zeros(1, 2)],
            dvector![0.0],
            Some(Arc::new(NoiseModel::unit(2)))
        )
        .is_err());
    }
}
