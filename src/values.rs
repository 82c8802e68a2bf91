//! Flat variable-value storage consumed by factor linearization.
//!
//! The manifold machinery that owns retraction and composition lives outside
//! this layer; factors only read plain coordinate vectors. Conventions:
//! camera poses are `[rx, ry, rz, tx, ty, tz]` (rotation vector followed by
//! translation, world-to-camera), landmarks are `[x, y, z]`, and pinhole
//! calibrations are `[fx, fy, cx, cy]`.

use std::collections::HashMap;

use nalgebra::DVector;

use crate::error::{SbaError, SbaResult};

/// Opaque identifier of one unknown (a camera pose, a landmark, a
/// calibration). Assigned by the graph owner, never by a factor.
pub type Key = usize;

/// Current estimates of all unknowns, keyed by [`Key`].
#[derive(Debug, Clone, Default)]
pub struct Values {
    map: HashMap<Key, DVector<f64>>,
}

impl Values {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert or replace the value of a variable.
    pub fn insert(&mut self, key: Key, value: DVector<f64>) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: Key) -> Option<&DVector<f64>> {
        self.map.get(&key)
    }

    /// Fetch a value and check its dimension. A missing key or a wrong
    /// dimension is a graph-construction bug and fails fast.
    pub fn vector(&self, key: Key, dim: usize) -> SbaResult<&DVector<f64>> {
        let v = self.map.get(&key).ok_or(SbaError::UnknownKey(key))?;
        if v.len() != dim {
            return Err(SbaError::DimensionMismatch {
                expected: dim,
                actual: v.len(),
            });
        }
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
