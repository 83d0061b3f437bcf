//! Pinhole camera with optional Brown-Conrady distortion.

use nalgebra::{Matrix3, Point2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub type CameraId = u32;

/// Points closer than this to the image plane are treated as behind the camera.
const MIN_DEPTH: f64 = 1e-9;

const UNDISTORT_ITERS: usize = 20;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("camera matrix contains non-finite values")]
    NonFinite,
    #[error("camera matrix is not invertible")]
    Singular,
    #[error("unsupported distortion model with {len} coefficients (expected 4 or 5)")]
    UnsupportedDistortion { len: usize },
}

/// Radial/tangential distortion in OpenCV order `[k1, k2, p1, p2, k3]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl BrownConrady {
    /// Parse an OpenCV coefficient vector.
    ///
    /// Accepts 4 or 5 values; longer vectors are accepted only when the
    /// extra (rational / thin-prism) terms are all zero.
    pub fn from_coefficients(c: &[f64]) -> Result<Self, CameraError> {
        if c.iter().any(|v| !v.is_finite()) {
            return Err(CameraError::NonFinite);
        }
        match c.len() {
            0 => Ok(Self::default()),
            4 | 5 => Ok(Self {
                k1: c[0],
                k2: c[1],
                p1: c[2],
                p2: c[3],
                k3: c.get(4).copied().unwrap_or(0.0),
            }),
            len if len > 5 && c[5..].iter().all(|v| *v == 0.0) => Self::from_coefficients(&c[..5]),
            len => Err(CameraError::UnsupportedDistortion { len }),
        }
    }

    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_identity(&self) -> bool {
        self.coefficients().iter().all(|v| *v == 0.0)
    }

    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xy = x * y;
        let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
        Vector2::new(x * radial + dx, y * radial + dy)
    }

    /// Fixed-point inversion of [`BrownConrady::distort`].
    pub fn undistort(&self, d: &Vector2<f64>) -> Vector2<f64> {
        if self.is_identity() {
            return *d;
        }
        let (mut x, mut y) = (d.x, d.y);
        for _ in 0..UNDISTORT_ITERS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            let xy = x * y;
            let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
            x = (d.x - dx) / radial;
            y = (d.y - dy) / radial;
        }
        Vector2::new(x, y)
    }
}

/// Intrinsic calibration of one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraIntrinsics {
    k: Matrix3<f64>,
    k_inv: Matrix3<f64>,
    distortion: BrownConrady,
}

impl CameraIntrinsics {
    pub fn new(k: Matrix3<f64>) -> Result<Self, CameraError> {
        if k.iter().any(|v| !v.is_finite()) {
            return Err(CameraError::NonFinite);
        }
        let k_inv = k.try_inverse().ok_or(CameraError::Singular)?;
        Ok(Self {
            k,
            k_inv,
            distortion: BrownConrady::default(),
        })
    }

    /// Build from a row-major 3x3 camera matrix as stored in `config.json`.
    pub fn from_rows(rows: [[f64; 3]; 3]) -> Result<Self, CameraError> {
        Self::new(Matrix3::from_fn(|r, c| rows[r][c]))
    }

    /// Convenience constructor for a zero-skew pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, CameraError> {
        Self::new(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
    }

    pub fn with_distortion(mut self, distortion: BrownConrady) -> Self {
        self.distortion = distortion;
        self
    }

    #[inline]
    pub fn k(&self) -> &Matrix3<f64> {
        &self.k
    }

    #[inline]
    pub fn distortion(&self) -> &BrownConrady {
        &self.distortion
    }

    /// Project a camera-frame point to pixels. `None` if the point is behind the camera.
    pub fn project(&self, p_cam: &Point3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let n = Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        let d = self.distortion.distort(&n);
        let v = self.k * Vector3::new(d.x, d.y, 1.0);
        Some(Point2::new(v.x / v.z, v.y / v.z))
    }

    /// Undistorted normalized image coordinates of a pixel.
    pub fn normalize(&self, pixel: &Point2<f64>) -> Vector2<f64> {
        let v = self.k_inv * Vector3::new(pixel.x, pixel.y, 1.0);
        self.distortion.undistort(&Vector2::new(v.x / v.z, v.y / v.z))
    }

    /// Pixel position the observation would have without lens distortion.
    pub fn undistort_pixel(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let n = self.normalize(pixel);
        let v = self.k * Vector3::new(n.x, n.y, 1.0);
        Point2::new(v.x / v.z, v.y / v.z)
    }
}
