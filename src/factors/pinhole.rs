//! Pinhole projection model and its analytic Jacobians
//!
//! The pinhole model projects camera-frame points to pixel coordinates:
//! ```text
//! x_norm = X / Z
//! y_norm = Y / Z
//! u = fx * x_norm + cx
//! v = fy * y_norm + cy
//! ```
//! The camera looks down +Z; a point at or behind the image plane (Z ≤ 0)
//! has no defined projection and is reported as a cheirality failure by
//! returning `None`.

use nalgebra::{DVector, Matrix2x3, Matrix2x4, Matrix3, Matrix3x6, Rotation3, Vector2, Vector3};

use crate::error::{SbaError, SbaResult};

/// Pinhole camera intrinsics `[fx, fy, cx, cy]`, no distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeIntrinsics {
    /// Focal length in x direction (pixels)
    pub fx: f64,
    /// Focal length in y direction (pixels)
    pub fy: f64,
    /// Principal point x coordinate (pixels)
    pub cx: f64,
    /// Principal point y coordinate (pixels)
    pub cy: f64,
}

impl PinholeIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Decode a calibration variable `[fx, fy, cx, cy]`.
    pub fn from_vector(v: &DVector<f64>) -> SbaResult<Self> {
        if v.len() != 4 {
            return Err(SbaError::DimensionMismatch {
                expected: 4,
                actual: v.len(),
            });
        }
        Ok(Self::new(v[0], v[1], v[2], v[3]))
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` when the point sits at or behind the image plane
    /// (projection-cheirality failure).
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        let x_norm = p_cam.x / p_cam.z;
        let y_norm = p_cam.y / p_cam.z;
        Some(Vector2::new(
            self.fx * x_norm + self.cx,
            self.fy * y_norm + self.cy,
        ))
    }

    /// 2×3 Jacobian of the projection w.r.t. the camera-frame point.
    ///
    /// ```text
    /// ∂u/∂X = fx / Z    ∂u/∂Y = 0         ∂u/∂Z = -fx * X / Z²
    /// ∂v/∂X = 0         ∂v/∂Y = fy / Z    ∂v/∂Z = -fy * Y / Z²
    /// ```
    pub fn jacobian_point(&self, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
        let z_inv = 1.0 / p_cam.z;
        let z_inv_sq = z_inv * z_inv;
        Matrix2x3::new(
            self.fx * z_inv,
            0.0,
            -self.fx * p_cam.x * z_inv_sq,
            0.0,
            self.fy * z_inv,
            -self.fy * p_cam.y * z_inv_sq,
        )
    }

    /// 2×4 Jacobian of the projection w.r.t. `[fx, fy, cx, cy]`.
    pub fn jacobian_intrinsics(&self, p_cam: &Vector3<f64>) -> Matrix2x4<f64> {
        let x_norm = p_cam.x / p_cam.z;
        let y_norm = p_cam.y / p_cam.z;
        Matrix2x4::new(
            x_norm, 0.0, 1.0, 0.0, // ∂u/∂[fx, fy, cx, cy]
            0.0, y_norm, 0.0, 1.0, // ∂v/∂[fx, fy, cx, cy]
        )
    }

    /// Component-wise equality within tolerance, for factor comparison.
    pub fn equals(&self, other: &Self, tol: f64) -> bool {
        (self.fx - other.fx).abs() <= tol
            && (self.fy - other.fy).abs() <= tol
            && (self.cx - other.cx).abs() <= tol
            && (self.cy - other.cy).abs() <= tol
    }
}

/// World-to-camera pose: `p_cam = R * p_world + t`.
///
/// Stored in variables as `[rx, ry, rz, tx, ty, tz]` (rotation vector
/// followed by translation). Jacobians are taken w.r.t. the right-perturbation
/// tangent in the same order, `[δθ, δρ]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl CameraPose {
    /// Decode a pose variable `[rx, ry, rz, tx, ty, tz]`.
    pub fn from_vector(v: &DVector<f64>) -> SbaResult<Self> {
        if v.len() != 6 {
            return Err(SbaError::DimensionMismatch {
                expected: 6,
                actual: v.len(),
            });
        }
        Ok(Self {
            rotation: Rotation3::new(Vector3::new(v[0], v[1], v[2])),
            translation: Vector3::new(v[3], v[4], v[5]),
        })
    }

    /// Transform a world point into the camera frame.
    pub fn transform(&self, p_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p_world + self.translation
    }

    /// 3×6 Jacobian of the camera-frame point w.r.t. the pose tangent
    /// `[δθ, δρ]` under right perturbation `R ← R·Exp(δθ)`, `t ← t + R·δρ`:
    ///
    /// ```text
    /// ∂p_cam/∂δθ = -R [p_world]×
    /// ∂p_cam/∂δρ = R
    /// ```
    pub fn jacobian_point_wrt_pose(&self, p_world: &Vector3<f64>) -> Matrix3x6<f64> {
        let r = self.rotation.matrix();
        let mut jac = Matrix3x6::zeros();
        jac.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-(r * p_world.cross_matrix())));
        jac.fixed_view_mut::<3, 3>(0, 3).copy_from(r);
        jac
    }

    /// 3×3 Jacobian of the camera-frame point w.r.t. the world point: `R`.
    pub fn jacobian_point_wrt_point(&self) -> Matrix3<f64> {
        *self.rotation.matrix()
    }
}
