//! Nonlinear measurement factors and their projection models
//!
//! # Module Structure
//!
//! - `pinhole`: projection geometry and analytic Jacobians
//! - `reprojection`: binary and ternary reprojection factors
//!
//! The factor family is a closed variant set: arities and per-variable
//! dimensions are fixed at construction, so linearization produces
//! fixed-size blocks without dynamic dispatch.

pub mod pinhole;
pub mod reprojection;

pub use pinhole::{CameraPose, PinholeIntrinsics};
pub use reprojection::{
    CalibratedReprojectionFactor, CalibratedReprojectionTerms, ProjectionOutcome,
    ReprojectionFactor, ReprojectionTerms, CALIB_DIM, LANDMARK_DIM, POSE_DIM, RESIDUAL_DIM,
};

use crate::error::SbaResult;
use crate::linear::BlockLinearFactor;
use crate::values::{Key, Values};

/// One nonlinear observation in the estimation graph.
///
/// Explicit-tag dispatch over the closed factor set; the graph owner holds
/// these and drives linearization once per solve round.
#[derive(Debug, Clone)]
pub enum MeasurementFactor {
    Reprojection(ReprojectionFactor),
    CalibratedReprojection(CalibratedReprojectionFactor),
}

impl MeasurementFactor {
    /// Keys of the variables this factor ties together, in tuple order.
    pub fn keys(&self) -> &[Key] {
        match self {
            MeasurementFactor::Reprojection(f) => f.keys(),
            MeasurementFactor::CalibratedReprojection(f) => f.keys(),
        }
    }

    /// Linearize at the supplied values.
    pub fn linearize(&self, values: &Values) -> SbaResult<BlockLinearFactor> {
        match self {
            MeasurementFactor::Reprojection(f) => f.linearize(values),
            MeasurementFactor::CalibratedReprojection(f) => f.linearize(values),
        }
    }

    /// Structural equality within tolerance; factors of different variants
    /// are never equal.
    pub fn equals(&self, other: &MeasurementFactor, tol: f64) -> bool {
        match (self, other) {
            (MeasurementFactor::Reprojection(a), MeasurementFactor::Reprojection(b)) => {
                a.equals(b, tol)
            }
            (
                MeasurementFactor::CalibratedReprojection(a),
                MeasurementFactor::CalibratedReprojection(b),
            ) => a.equals(b, tol),
            _ => false,
        }
    }
}

impl From<ReprojectionFactor> for MeasurementFactor {
    fn from(f: ReprojectionFactor) -> Self {
        MeasurementFactor::Reprojection(f)
    }
}

impl From<CalibratedReprojectionFactor> for MeasurementFactor {
    fn from(f: CalibratedReprojectionFactor) -> Self {
        MeasurementFactor::CalibratedReprojection(f)
    }
}
