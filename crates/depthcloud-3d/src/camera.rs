use glam::{DMat3, DMat4, DVec3};
use thiserror::Error;

/// Pose determinants below this magnitude are treated as singular.
const SINGULAR_POSE_EPS: f64 = 1e-12;

/// Errors raised while building camera models.
#[derive(Debug, Error, PartialEq)]
pub enum CameraError {
    /// The intrinsic parameters cannot describe a pinhole camera.
    #[error("invalid intrinsics: {0}")]
    InvalidIntrinsics(String),

    /// The pose matrix contains NaN or infinite values.
    #[error("pose matrix contains non-finite values")]
    NonFinitePose,

    /// The pose matrix cannot be inverted.
    #[error("pose matrix is not invertible (determinant {0})")]
    SingularPose(f64),
}

/// Represents the intrinsic parameters of a pinhole camera.
///
/// # Fields
///
/// * `fx` - The focal length in the x direction
/// * `fy` - The focal length in the y direction
/// * `cx` - The x coordinate of the principal point
/// * `cy` - The y coordinate of the principal point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeIntrinsics {
    /// The focal length in the x direction
    pub fx: f64,
    /// The focal length in the y direction
    pub fy: f64,
    /// The x coordinate of the principal point
    pub cx: f64,
    /// The y coordinate of the principal point
    pub cy: f64,
}

impl PinholeIntrinsics {
    /// Creates the intrinsics, rejecting non-finite values and zero focal lengths.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, CameraError> {
        if ![fx, fy, cx, cy].iter().all(|v| v.is_finite()) {
            return Err(CameraError::InvalidIntrinsics(format!(
                "non-finite parameters fx={fx} fy={fy} cx={cx} cy={cy}"
            )));
        }
        if fx == 0.0 || fy == 0.0 {
            return Err(CameraError::InvalidIntrinsics(format!(
                "focal lengths must be non-zero, got fx={fx} fy={fy}"
            )));
        }
        Ok(Self { fx, fy, cx, cy })
    }

    /// Reads the intrinsics from a row-major 3x3 camera matrix `K`.
    ///
    /// Example:
    ///
    /// ```
    /// use depthcloud_3d::camera::PinholeIntrinsics;
    ///
    /// let k = [[525.0, 0.0, 319.5], [0.0, 525.0, 239.5], [0.0, 0.0, 1.0]];
    /// let intrinsics = PinholeIntrinsics::from_matrix(&k).unwrap();
    /// assert_eq!(intrinsics.cx, 319.5);
    /// assert_eq!(intrinsics.to_matrix(), k);
    /// ```
    pub fn from_matrix(k: &[[f64; 3]; 3]) -> Result<Self, CameraError> {
        Self::new(k[0][0], k[1][1], k[0][2], k[1][2])
    }

    /// Returns the row-major 3x3 camera matrix.
    pub fn to_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }
}

/// A 4x4 homogeneous pose mapping points from one frame into another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidPose(DMat4);

impl RigidPose {
    /// The identity pose.
    pub fn identity() -> Self {
        Self(DMat4::IDENTITY)
    }

    /// Builds a pose from a row-major 4x4 matrix.
    pub fn from_matrix(m: &[[f64; 4]; 4]) -> Self {
        Self(DMat4::from_cols_array_2d(m).transpose())
    }

    /// Builds a pose from a row-major rotation matrix and a translation vector.
    pub fn from_rotation_translation(rotation: &[[f64; 3]; 3], translation: &[f64; 3]) -> Self {
        let rotation = DMat3::from_cols_array_2d(rotation).transpose();
        Self(DMat4::from_cols(
            rotation.x_axis.extend(0.0),
            rotation.y_axis.extend(0.0),
            rotation.z_axis.extend(0.0),
            DVec3::from_array(*translation).extend(1.0),
        ))
    }

    /// Returns the pose as a row-major 4x4 matrix.
    pub fn to_matrix(&self) -> [[f64; 4]; 4] {
        self.0.transpose().to_cols_array_2d()
    }

    /// Inverts the pose.
    ///
    /// # Errors
    ///
    /// Returns [`CameraError::NonFinitePose`] for NaN/infinite entries and
    /// [`CameraError::SingularPose`] when the determinant vanishes.
    pub fn inverse(&self) -> Result<Self, CameraError> {
        if !self.0.is_finite() {
            return Err(CameraError::NonFinitePose);
        }
        let det = self.0.determinant();
        if !det.is_finite() || det.abs() < SINGULAR_POSE_EPS {
            return Err(CameraError::SingularPose(det));
        }
        Ok(Self(self.0.inverse()))
    }

    /// Applies the pose to a point.
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        self.0.transform_point3(DVec3::from_array(p)).to_array()
    }
}

impl Default for RigidPose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Pinhole projection model combined with a pose, evaluated in `f32` per pixel.
///
/// `rigid_transform` applies the stored pose; the unprojection kernel builds
/// this with the camera->world pose, forward projection with world->camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraTransform {
    fx: f32,
    fy: f32,
    cx: f32,
    cy: f32,
    // top three rows of the pose, row-major
    pose: [[f32; 4]; 3],
}

impl CameraTransform {
    /// Creates the transform from intrinsics and a pose.
    pub fn new(intrinsics: &PinholeIntrinsics, pose: &RigidPose) -> Self {
        let m = pose.to_matrix();
        let mut rows = [[0.0f32; 4]; 3];
        for (dst, src) in rows.iter_mut().zip(m.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *s as f32;
            }
        }
        Self {
            fx: intrinsics.fx as f32,
            fy: intrinsics.fy as f32,
            cx: intrinsics.cx as f32,
            cy: intrinsics.cy as f32,
            pose: rows,
        }
    }

    /// Returns `[fx, fy, cx, cy]`.
    #[inline]
    pub fn intrinsics(&self) -> [f32; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }

    /// Returns the top three rows of the pose.
    #[inline]
    pub fn pose_rows(&self) -> &[[f32; 4]; 3] {
        &self.pose
    }

    /// Lifts pixel `(u, v)` at metric `depth` into camera space.
    #[inline(always)]
    pub fn unproject(&self, u: f32, v: f32, depth: f32) -> [f32; 3] {
        [
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        ]
    }

    /// Applies the stored pose to `p`.
    #[inline(always)]
    pub fn rigid_transform(&self, p: [f32; 3]) -> [f32; 3] {
        let [r0, r1, r2] = &self.pose;
        [
            r0[0] * p[0] + r0[1] * p[1] + r0[2] * p[2] + r0[3],
            r1[0] * p[0] + r1[1] * p[1] + r1[2] * p[2] + r1[3],
            r2[0] * p[0] + r2[1] * p[1] + r2[2] * p[2] + r2[3],
        ]
    }

    /// Projects camera-space point `p` onto the image plane.
    ///
    /// Points with `z == 0` project to non-finite coordinates.
    #[inline(always)]
    pub fn project(&self, p: [f32; 3]) -> [f32; 2] {
        [
            self.fx * p[0] / p[2] + self.cx,
            self.fy * p[1] / p[2] + self.cy,
        ]
    }
}
