//! Reprojection measurement factors for bundle adjustment
//!
//! A reprojection factor ties a 2-D image observation to the unknowns that
//! produced it:
//!
//! - [`ReprojectionFactor`]: binary, camera pose + landmark, with the
//!   pinhole intrinsics held fixed inside the factor.
//! - [`CalibratedReprojectionFactor`]: ternary, camera pose + landmark +
//!   calibration, for self-calibrating reconstruction.
//!
//! # Error model
//!
//! ```text
//! r(T, p) = π(T ⊕ p) - z
//! ```
//! where `T` is the camera pose, `p` the landmark, `π` the pinhole
//! projection, and `z` the observed pixel. Linearization negates the
//! residual so that the produced linear system solves for a correcting
//! step (`b = -r`), and whitens blocks and residual by the attached noise
//! model.
//!
//! # Degenerate geometry
//!
//! A landmark at or behind the image plane has no defined projection. One
//! bad triangulation must not abort an optimization step over thousands of
//! measurements, so evaluation reports [`ProjectionOutcome::Degenerate`]
//! and linearization soft-drops the factor: zero Jacobian blocks and a zero
//! residual, contributing nothing to this round's linear system. A warning
//! is logged; the call succeeds.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x4, Matrix2x6, Vector2, Vector3};
use tracing::warn;

use crate::error::{SbaError, SbaResult};
use crate::factors::pinhole::{CameraPose, PinholeIntrinsics};
use crate::linear::BlockLinearFactor;
use crate::noise::NoiseModel;
use crate::values::{Key, Values};

/// Tangent dimension of a camera pose variable.
pub const POSE_DIM: usize = 6;
/// Dimension of a landmark variable.
pub const LANDMARK_DIM: usize = 3;
/// Dimension of a pinhole calibration variable.
pub const CALIB_DIM: usize = 4;
/// Dimension of a pixel residual.
pub const RESIDUAL_DIM: usize = 2;

/// Outcome of evaluating a projection-based error at a linearization point.
#[derive(Debug, Clone)]
pub enum ProjectionOutcome<T> {
    /// Projection succeeded; the contained error terms are valid.
    Evaluated(T),
    /// Projection-cheirality failure: the landmark sits at or behind the
    /// image plane. The factor contributes nothing this round.
    Degenerate,
}

impl<T> ProjectionOutcome<T> {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, ProjectionOutcome::Degenerate)
    }
}

/// Residual and unwhitened Jacobian blocks of a binary reprojection factor.
#[derive(Debug, Clone)]
pub struct ReprojectionTerms {
    /// `predicted - observed`, in pixels.
    pub residual: Vector2<f64>,
    pub jacobian_pose: Matrix2x6<f64>,
    pub jacobian_landmark: Matrix2x3<f64>,
}

/// Residual and unwhitened Jacobian blocks of a ternary reprojection factor.
#[derive(Debug, Clone)]
pub struct CalibratedReprojectionTerms {
    /// `predicted - observed`, in pixels.
    pub residual: Vector2<f64>,
    pub jacobian_pose: Matrix2x6<f64>,
    pub jacobian_landmark: Matrix2x3<f64>,
    pub jacobian_calibration: Matrix2x4<f64>,
}

fn check_noise_dim(noise: &Option<Arc<NoiseModel>>) -> SbaResult<()> {
    if let Some(model) = noise {
        if model.dim() != RESIDUAL_DIM {
            return Err(SbaError::DimensionMismatch {
                expected: RESIDUAL_DIM,
                actual: model.dim(),
            });
        }
    }
    Ok(())
}

/// Noise model a linearized factor should carry: whitening bakes diagonal
/// scaling into the blocks, so only the equality-constraint structure of a
/// constrained model survives, as its unit variant.
fn attached_model(noise: &Option<Arc<NoiseModel>>) -> Option<Arc<NoiseModel>> {
    match noise {
        Some(model) if model.is_constrained() => Some(Arc::new(model.unit_variant())),
        _ => None,
    }
}

/// Binary factor: one 2-D observation of a landmark from a camera with
/// known intrinsics.
#[derive(Debug, Clone)]
pub struct ReprojectionFactor {
    keys: [Key; 2],
    measured: Vector2<f64>,
    intrinsics: PinholeIntrinsics,
    noise: Option<Arc<NoiseModel>>,
}

impl ReprojectionFactor {
    /// Create a factor observing `landmark_key` from `pose_key`.
    ///
    /// The noise model, when present, must have dimension 2.
    pub fn new(
        pose_key: Key,
        landmark_key: Key,
        measured: Vector2<f64>,
        intrinsics: PinholeIntrinsics,
        noise: Option<Arc<NoiseModel>>,
    ) -> SbaResult<Self> {
        check_noise_dim(&noise)?;
        Ok(Self {
            keys: [pose_key, landmark_key],
            measured,
            intrinsics,
            noise,
        })
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn pose_key(&self) -> Key {
        self.keys[0]
    }

    pub fn landmark_key(&self) -> Key {
        self.keys[1]
    }

    /// The observed pixel location.
    pub fn measured(&self) -> &Vector2<f64> {
        &self.measured
    }

    pub fn intrinsics(&self) -> &PinholeIntrinsics {
        &self.intrinsics
    }

    pub fn noise_model(&self) -> Option<&Arc<NoiseModel>> {
        self.noise.as_ref()
    }

    /// Evaluate `predicted - observed` and the partials of the prediction
    /// w.r.t. pose and landmark (unwhitened).
    pub fn evaluate_error(
        &self,
        values: &Values,
    ) -> SbaResult<ProjectionOutcome<ReprojectionTerms>> {
        let pose = CameraPose::from_vector(values.vector(self.pose_key(), POSE_DIM)?)?;
        let landmark = values.vector(self.landmark_key(), LANDMARK_DIM)?;
        let p_world = Vector3::new(landmark[0], landmark[1], landmark[2]);

        let p_cam = pose.transform(&p_world);
        let Some(uv) = self.intrinsics.project(&p_cam) else {
            warn!(
                landmark = self.landmark_key(),
                camera = self.pose_key(),
                "landmark behind camera, factor dropped for this linearization"
            );
            return Ok(ProjectionOutcome::Degenerate);
        };

        let j_proj = self.intrinsics.jacobian_point(&p_cam);
        Ok(ProjectionOutcome::Evaluated(ReprojectionTerms {
            residual: uv - self.measured,
            jacobian_pose: j_proj * pose.jacobian_point_wrt_pose(&p_world),
            jacobian_landmark: j_proj * pose.jacobian_point_wrt_point(),
        }))
    }

    /// Linearize at the supplied values: negate the residual, whiten, and
    /// package fixed-size blocks. Degenerate geometry yields an all-zero
    /// factor (soft-drop).
    pub fn linearize(&self, values: &Values) -> SbaResult<BlockLinearFactor> {
        let (a_pose, a_landmark, b) = match self.evaluate_error(values)? {
            ProjectionOutcome::Evaluated(terms) => (
                DMatrix::from_iterator(RESIDUAL_DIM, POSE_DIM, terms.jacobian_pose.iter().copied()),
                DMatrix::from_iterator(
                    RESIDUAL_DIM,
                    LANDMARK_DIM,
                    terms.jacobian_landmark.iter().copied(),
                ),
                DVector::from_column_slice(&[-terms.residual[0], -terms.residual[1]]),
            ),
            ProjectionOutcome::Degenerate => (
                DMatrix::zeros(RESIDUAL_DIM, POSE_DIM),
                DMatrix::zeros(RESIDUAL_DIM, LANDMARK_DIM),
                DVector::zeros(RESIDUAL_DIM),
            ),
        };

        let (a_pose, a_landmark, b) = match &self.noise {
            Some(model) if !model.is_unit() => (
                model.whiten_matrix(&a_pose)?,
                model.whiten_matrix(&a_landmark)?,
                model.whiten_vector(&b)?,
            ),
            _ => (a_pose, a_landmark, b),
        };

        BlockLinearFactor::new(
            self.keys.to_vec(),
            vec![a_pose, a_landmark],
            b,
            attached_model(&self.noise),
        )
    }

    /// Structural equality of key tuple, measurement, and intrinsics within
    /// tolerance. Test support, not business logic.
    pub fn equals(&self, other: &Self, tol: f64) -> bool {
        self.keys == other.keys
            && (self.measured - other.measured).amax() <= tol
            && self.intrinsics.equals(&other.intrinsics, tol)
    }
}

/// Ternary factor: one 2-D observation tying camera pose, landmark, and
/// pinhole calibration together.
#[derive(Debug, Clone)]
pub struct CalibratedReprojectionFactor {
    keys: [Key; 3],
    measured: Vector2<f64>,
    noise: Option<Arc<NoiseModel>>,
}

impl CalibratedReprojectionFactor {
    /// Create a factor observing `landmark_key` from `pose_key` with
    /// calibration `calibration_key`.
    pub fn new(
        pose_key: Key,
        landmark_key: Key,
        calibration_key: Key,
        measured: Vector2<f64>,
        noise: Option<Arc<NoiseModel>>,
    ) -> SbaResult<Self> {
        check_noise_dim(&noise)?;
        Ok(Self {
            keys: [pose_key, landmark_key, calibration_key],
            measured,
            noise,
        })
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn pose_key(&self) -> Key {
        self.keys[0]
    }

    pub fn landmark_key(&self) -> Key {
        self.keys[1]
    }

    pub fn calibration_key(&self) -> Key {
        self.keys[2]
    }

    /// The observed pixel location.
    pub fn measured(&self) -> &Vector2<f64> {
        &self.measured
    }

    pub fn noise_model(&self) -> Option<&Arc<NoiseModel>> {
        self.noise.as_ref()
    }

    /// Evaluate `predicted - observed` and the partials of the prediction
    /// w.r.t. pose, landmark, and calibration (unwhitened).
    pub fn evaluate_error(
        &self,
        values: &Values,
    ) -> SbaResult<ProjectionOutcome<CalibratedReprojectionTerms>> {
        let pose = CameraPose::from_vector(values.vector(self.pose_key(), POSE_DIM)?)?;
        let landmark = values.vector(self.landmark_key(), LANDMARK_DIM)?;
        let p_world = Vector3::new(landmark[0], landmark[1], landmark[2]);
        let intrinsics =
            PinholeIntrinsics::from_vector(values.vector(self.calibration_key(), CALIB_DIM)?)?;

        let p_cam = pose.transform(&p_world);
        let Some(uv) = intrinsics.project(&p_cam) else {
            warn!(
                landmark = self.landmark_key(),
                camera = self.pose_key(),
                "landmark behind camera, factor dropped for this linearization"
            );
            return Ok(ProjectionOutcome::Degenerate);
        };

        let j_proj = intrinsics.jacobian_point(&p_cam);
        Ok(ProjectionOutcome::Evaluated(CalibratedReprojectionTerms {
            residual: uv - self.measured,
            jacobian_pose: j_proj * pose.jacobian_point_wrt_pose(&p_world),
            jacobian_landmark: j_proj * pose.jacobian_point_wrt_point(),
            jacobian_calibration: intrinsics.jacobian_intrinsics(&p_cam),
        }))
    }

    /// Linearize at the supplied values; see
    /// [`ReprojectionFactor::linearize`].
    pub fn linearize(&self, values: &Values) -> SbaResult<BlockLinearFactor> {
        let (a_pose, a_landmark, a_calib, b) = match self.evaluate_error(values)? {
            ProjectionOutcome::Evaluated(terms) => (
                DMatrix::from_iterator(RESIDUAL_DIM, POSE_DIM, terms.jacobian_pose.iter().copied()),
                DMatrix::from_iterator(
                    RESIDUAL_DIM,
                    LANDMARK_DIM,
                    terms.jacobian_landmark.iter().copied(),
                ),
                DMatrix::from_iterator(
                    RESIDUAL_DIM,
                    CALIB_DIM,
                    terms.jacobian_calibration.iter().copied(),
                ),
                DVector::from_column_slice(&[-terms.residual[0], -terms.residual[1]]),
            ),
            ProjectionOutcome::Degenerate => (
                DMatrix::zeros(RESIDUAL_DIM, POSE_DIM),
                DMatrix::zeros(RESIDUAL_DIM, LANDMARK_DIM),
                DMatrix::zeros(RESIDUAL_DIM, CALIB_DIM),
                DVector::zeros(RESIDUAL_DIM),
            ),
        };

        let (a_pose, a_landmark, a_calib, b) = match &self.noise {
            Some(model) if !model.is_unit() => (
                model.whiten_matrix(&a_pose)?,
                model.whiten_matrix(&a_landmark)?,
                model.whiten_matrix(&a_calib)?,
                model.whiten_vector(&b)?,
            ),
            _ => (a_pose, a_landmark, a_calib, b),
        };

        BlockLinearFactor::new(
            self.keys.to_vec(),
            vec![a_pose, a_landmark, a_calib],
            b,
            attached_model(&self.noise),
        )
    }

    /// Structural equality of key tuple and measurement within tolerance.
    pub fn equals(&self, other: &Self, tol: f64) -> bool {
        self.keys == other.keys && (self.measured - other.measured).amax() <= tol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::pinhole::PinholeIntrinsics;
    use nalgebra::dvector;

    fn test_values(landmark: [f64; 3]) -> Values {
        let mut values = Values::new();
        values.insert(0, dvector![0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        values.insert(1, dvector![landmark[0], landmark[1], landmark[2]]);
        values.insert(2, dvector![500.0, 500.0, 320.0, 240.0]);
        values
    }

    fn intrinsics() -> PinholeIntrinsics {
        PinholeIntrinsics::new(500.0, 500.0, 320.0, 240.0)
    }

    #[test]
    fn test_zero_residual_at_perfect_observation() {
        let p_world = Vector3::new(0.1, 0.2, 1.0);
        let uv = intrinsics().project(&p_world).unwrap();
        let factor = ReprojectionFactor::new(0, 1, uv, intrinsics(), None).unwrap();

        let values = test_values([0.1, 0.2, 1.0]);
        match factor.evaluate_error(&values).unwrap() {
            ProjectionOutcome::Evaluated(terms) => {
                assert!(terms.residual.norm() < 1e-10);
            }
            ProjectionOutcome::Degenerate => panic!("expected evaluated terms"),
        }
    }

    #[test]
    fn test_degenerate_when_landmark_behind_camera() {
        let factor =
            ReprojectionFactor::new(0, 1, Vector2::new(100.0, 100.0), intrinsics(), None).unwrap();
        let values = test_values([0.0, 0.0, -1.0]);

        let outcome = factor.evaluate_error(&values).unwrap();
        assert!(outcome.is_degenerate());

        // Soft-drop: the linearized factor is all zeros.
        let linear = factor.linearize(&values).unwrap();
        assert!(linear.rhs().norm() == 0.0);
        assert!(linear.block(0).norm() == 0.0);
        assert!(linear.block(1).norm() == 0.0);
    }

    #[test]
    fn test_linearize_negates_residual() {
        let p_world = Vector3::new(0.1, 0.2, 1.0);
        let uv = intrinsics().project(&p_world).unwrap();
        // Shift the observation so the residual is (2, -3).
        let measured = uv - Vector2::new(2.0, -3.0);
        let factor = ReprojectionFactor::new(0, 1, measured, intrinsics(), None).unwrap();

        let values = test_values([0.1, 0.2, 1.0]);
        let linear = factor.linearize(&values).unwrap();
        assert!((linear.rhs()[0] - (-2.0)).abs() < 1e-9);
        assert!((linear.rhs()[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_linearize_whitens_blocks_and_rhs() {
        let p_world = Vector3::new(0.1, 0.2, 1.0);
        let uv = intrinsics().project(&p_world).unwrap();
        let measured = uv - Vector2::new(1.0, 1.0);
        let model = Arc::new(NoiseModel::from_sigmas(&[0.5, 2.0]).unwrap());

        let plain = ReprojectionFactor::new(0, 1, measured, intrinsics(), None).unwrap();
        let noisy =
            ReprojectionFactor::new(0, 1, measured, intrinsics(), Some(model.clone())).unwrap();

        let values = test_values([0.1, 0.2, 1.0]);
        let lin_plain = plain.linearize(&values).unwrap();
        let lin_noisy = noisy.linearize(&values).unwrap();

        // Whitening baked in, no model attached afterwards.
        assert!(lin_noisy.noise_model().is_none());
        for col in 0..POSE_DIM {
            assert!(
                (lin_noisy.block(0)[(0, col)] - 2.0 * lin_plain.block(0)[(0, col)]).abs() < 1e-9
            );
            assert!(
                (lin_noisy.block(0)[(1, col)] - 0.5 * lin_plain.block(0)[(1, col)]).abs() < 1e-9
            );
        }
        assert!((lin_noisy.rhs()[0] - 2.0 * lin_plain.rhs()[0]).abs() < 1e-9);
        assert!((lin_noisy.rhs()[1] - 0.5 * lin_plain.rhs()[1]).abs() < 1e-9);
    }

    #[test]
    fn test_linearize_constrained_attaches_unit_variant() {
        let p_world = Vector3::new(0.1, 0.2, 1.0);
        let uv = intrinsics().project(&p_world).unwrap();
        let model = Arc::new(NoiseModel::constrained(&[0.0, 2.0]).unwrap());
        let factor = ReprojectionFactor::new(0, 1, uv, intrinsics(), Some(model)).unwrap();

        let values = test_values([0.1, 0.2, 1.0]);
        let linear = factor.linearize(&values).unwrap();
        let attached = linear.noise_model().expect("unit variant must survive");
        assert!(attached.is_constrained());
        assert_eq!(
            **attached,
            NoiseModel::constrained(&[0.0, 1.0]).unwrap(),
            "scale must be stripped, structure kept"
        );
    }

    #[test]
    fn test_binary_jacobians_match_finite_differences() {
        let measured = Vector2::new(330.0, 250.0);
        let factor = ReprojectionFactor::new(0, 1, measured, intrinsics(), None).unwrap();

        let mut values = Values::new();
        values.insert(0, dvector![0.1, -0.05, 0.2, 0.3, -0.1, 0.4]);
        values.insert(1, dvector![0.4, 0.2, 2.0]);

        let terms = match factor.evaluate_error(&values).unwrap() {
            ProjectionOutcome::Evaluated(t) => t,
            ProjectionOutcome::Degenerate => panic!("geometry should be valid"),
        };

        // Landmark Jacobian by central differences on the landmark entries.
        let epsilon = 1e-6;
        for i in 0..LANDMARK_DIM {
            let mut plus = values.clone();
            let mut minus = values.clone();
            let mut lm = values.get(1).unwrap().clone();
            lm[i] += epsilon;
            plus.insert(1, lm.clone());
            lm[i] -= 2.0 * epsilon;
            minus.insert(1, lm);

            let r_plus = match factor.evaluate_error(&plus).unwrap() {
                ProjectionOutcome::Evaluated(t) => t.residual,
                ProjectionOutcome::Degenerate => panic!("geometry should be valid"),
            };
            let r_minus = match factor.evaluate_error(&minus).unwrap() {
                ProjectionOutcome::Evaluated(t) => t.residual,
                ProjectionOutcome::Degenerate => panic!("geometry should be valid"),
            };
            let fd = (r_plus - r_minus) / (2.0 * epsilon);

            assert!((terms.jacobian_landmark[(0, i)] - fd[0]).abs() < 1e-4);
            assert!((terms.jacobian_landmark[(1, i)] - fd[1]).abs() < 1e-4);
        }

        // Translation part of the pose Jacobian: perturbing t directly matches
        // the right-perturbation tangent δρ premultiplied by R, so compare
        // against J_pose · [0; R⁻¹ e_i] — equivalently finite-difference the
        // stored coordinates and map through the analytic chain.
        let pose = CameraPose::from_vector(values.get(0).unwrap()).unwrap();
        let r_inv = pose.rotation.inverse();
        for i in 0..3 {
            let mut plus = values.clone();
            let mut minus = values.clone();
            let mut pv = values.get(0).unwrap().clone();
            pv[3 + i] += epsilon;
            plus.insert(0, pv.clone());
            pv[3 + i] -= 2.0 * epsilon;
            minus.insert(0, pv);

            let r_plus = match factor.evaluate_error(&plus).unwrap() {
                ProjectionOutcome::Evaluated(t) => t.residual,
                ProjectionOutcome::Degenerate => panic!("geometry should be valid"),
            };
            let r_minus = match factor.evaluate_error(&minus).unwrap() {
                ProjectionOutcome::Evaluated(t) => t.residual,
                ProjectionOutcome::Degenerate => panic!("geometry should be valid"),
            };
            let fd = (r_plus - r_minus) / (2.0 * epsilon);

            // d r / d t_i = J_pose[:, 3..6] · (R⁻¹ e_i)
            let mut e = Vector3::zeros();
            e[i] = 1.0;
            let tangent = r_inv * e;
            let mut expected = Vector2::<f64>::zeros();
            for k in 0..3 {
                expected[0] += terms.jacobian_pose[(0, 3 + k)] * tangent[k];
                expected[1] += terms.jacobian_pose[(1, 3 + k)] * tangent[k];
            }
            assert!((expected[0] - fd[0]).abs() < 1e-4);
            assert!((expected[1] - fd[1]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_ternary_factor_blocks_and_calibration_jacobian() {
        let p_world = Vector3::new(0.1, 0.2, 1.0);
        let uv = intrinsics().project(&p_world).unwrap();
        let factor = CalibratedReprojectionFactor::new(0, 1, 2, uv, None).unwrap();

        let values = test_values([0.1, 0.2, 1.0]);
        let linear = factor.linearize(&values).unwrap();
        assert_eq!(linear.keys(), &[0, 1, 2]);
        assert_eq!(linear.block(0).ncols(), POSE_DIM);
        assert_eq!(linear.block(1).ncols(), LANDMARK_DIM);
        assert_eq!(linear.block(2).ncols(), CALIB_DIM);
        assert!(linear.rhs().norm() < 1e-10);

        let terms = match factor.evaluate_error(&values).unwrap() {
            ProjectionOutcome::Evaluated(t) => t,
            ProjectionOutcome::Degenerate => panic!("geometry should be valid"),
        };
        // ∂u/∂cx = 1, ∂v/∂cy = 1 regardless of geometry.
        assert!((terms.jacobian_calibration[(0, 2)] - 1.0).abs() < 1e-12);
        assert!((terms.jacobian_calibration[(1, 3)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_equals_tolerance() {
        let a = ReprojectionFactor::new(0, 1, Vector2::new(10.0, 20.0), intrinsics(), None)
            .unwrap();
        let b = ReprojectionFactor::new(0, 1, Vector2::new(10.0, 20.0 + 1e-10), intrinsics(), None)
            .unwrap();
        let c = ReprojectionFactor::new(0, 2, Vector2::new(10.0, 20.0), intrinsics(), None)
            .unwrap();

        assert!(a.equals(&b, 1e-9));
        assert!(!a.equals(&b, 1e-12));
        assert!(!a.equals(&c, 1e-9));
    }

    #[test]
    fn test_noise_model_dimension_checked_at_construction() {
        let model = Arc::new(NoiseModel::unit(3));
        let result =
            ReprojectionFactor::new(0, 1, Vector2::zeros(), intrinsics(), Some(model));
        assert_eq!(
            result.unwrap_err(),
            SbaError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }
}
