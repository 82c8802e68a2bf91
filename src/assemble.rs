//! Parallel linearization and information-matrix assembly.
//!
//! Linearization of distinct factors shares no state, so it fans out across
//! rayon workers with no synchronization. The one shared-mutation point is
//! the accumulator; instead of locking it per block, each worker folds its
//! share of factors into a private partial [`BlockInfoMatrix`] and the
//! partials are reduced by block-wise addition. Accumulation is purely
//! additive, so the result is independent of the work split up to
//! floating-point summation order.

use rayon::prelude::*;
use tracing::debug;

use crate::error::{SbaError, SbaResult};
use crate::factors::MeasurementFactor;
use crate::linear::{BlockInfoMatrix, BlockLinearFactor, SlotAssignment};
use crate::values::Values;

/// Slot assignment covering the union of keys across `factors`, in
/// first-seen order.
pub fn slot_assignment(factors: &[MeasurementFactor]) -> SlotAssignment {
    SlotAssignment::from_keys(factors.iter().flat_map(|f| f.keys().iter().copied()))
}

/// Linearize every factor at the supplied values, in parallel.
pub fn linearize_all(
    factors: &[MeasurementFactor],
    values: &Values,
) -> SbaResult<Vec<BlockLinearFactor>> {
    factors.par_iter().map(|f| f.linearize(values)).collect()
}

/// Per-slot variable dimensions derived from the factors' block widths.
///
/// Every slot must be touched by at least one factor, and all factors
/// touching a slot must agree on its width.
pub fn variable_dims(
    factors: &[BlockLinearFactor],
    slots: &SlotAssignment,
) -> SbaResult<Vec<usize>> {
    let mut dims = vec![0usize; slots.num_variables()];
    for factor in factors {
        for (pos, &key) in factor.keys().iter().enumerate() {
            let slot = slots.slot(key).ok_or(SbaError::UnknownKey(key))?;
            let width = factor.block(pos).ncols();
            if dims[slot] == 0 {
                dims[slot] = width;
            } else if dims[slot] != width {
                return Err(SbaError::DimensionMismatch {
                    expected: dims[slot],
                    actual: width,
                });
            }
        }
    }
    if let Some(slot) = dims.iter().position(|&d| d == 0) {
        return Err(SbaError::InvalidInput(format!(
            "no factor touches the variable assigned to slot {slot}"
        )));
    }
    Ok(dims)
}

/// Assemble the Gauss-Newton normal equations from linearized factors.
///
/// Per-worker partial accumulators are built in parallel and reduced by
/// [`BlockInfoMatrix::merge`].
pub fn build_information(
    factors: &[BlockLinearFactor],
    slots: &SlotAssignment,
) -> SbaResult<BlockInfoMatrix> {
    let dims = variable_dims(factors, slots)?;
    debug!(
        factors = factors.len(),
        variables = dims.len(),
        "assembling block information matrix"
    );
    factors
        .par_iter()
        .try_fold(
            || BlockInfoMatrix::new(&dims),
            |mut partial, factor| {
                factor.update_hessian(slots, &mut partial)?;
                Ok::<_, SbaError>(partial)
            },
        )
        .try_reduce(
            || BlockInfoMatrix::new(&dims),
            |mut left, right| {
                left.merge(&right)?;
                Ok(left)
            },
        )
}
