//! Rigid transforms for the three map variants.
//!
//! Tags are stored in one of three representations, picked once per map:
//! - [`Se2`]: position in the tag plane plus heading (`"2d"` maps),
//! - [`Se2Height`]: the same with an additive height offset along world z (`"2.5d"` maps),
//! - [`Se3`]: a full rigid transform (`"3d"` maps).
//!
//! Viewpoints are always [`Se3`]. All representations share the [`PoseAlgebra`]
//! interface so graph and refinement code never look at the concrete parameterization.

use nalgebra::{Isometry3, Matrix3, Matrix4, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

pub type Iso3 = Isometry3<f64>;

/// Errors raised when building a pose from raw numbers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("pose contains non-finite values")]
    NonFinite,
    #[error("rotation block is a reflection (det={det:.3})")]
    Reflection { det: f64 },
    #[error("unknown map type `{0}` (expected 2d, 2.5d or 3d)")]
    UnknownMapKind(String),
}

/// Map variant, serialized with the tags used in `map.json`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapKind {
    #[serde(rename = "2d")]
    Planar,
    #[serde(rename = "2.5d")]
    PlanarHeight,
    #[serde(rename = "3d")]
    Spatial,
}

impl MapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapKind::Planar => "2d",
            MapKind::PlanarHeight => "2.5d",
            MapKind::Spatial => "3d",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapKind {
    type Err = PoseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2d" => Ok(MapKind::Planar),
            "2.5d" => Ok(MapKind::PlanarHeight),
            "3d" => Ok(MapKind::Spatial),
            other => Err(PoseError::UnknownMapKind(other.to_string())),
        }
    }
}

/// Wrap an angle into `(-pi, pi]`. Angles already in range are returned unchanged.
pub fn wrap_angle(theta: f64) -> f64 {
    if theta > -PI && theta <= PI {
        return theta;
    }
    let wrapped = (theta + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Rotation about world z that best explains `iso`'s x axis.
fn yaw_of(iso: &Iso3) -> f64 {
    let r = iso.rotation.to_rotation_matrix();
    r[(1, 0)].atan2(r[(0, 0)])
}

/// Group operations shared by every pose representation.
pub trait PoseAlgebra: Copy + fmt::Debug + PartialEq {
    /// Dimension of the tangent space used by [`PoseAlgebra::perturb`].
    const DOF: usize;

    fn identity() -> Self;

    /// `self ∘ rhs`: apply `rhs` first, then `self`.
    fn compose(&self, rhs: &Self) -> Self;

    fn inverse(&self) -> Self;

    fn transform_point(&self, p: &Point3<f64>) -> Point3<f64>;

    /// Apply a small tangent-space delta of length [`PoseAlgebra::DOF`].
    fn perturb(&self, delta: &[f64]) -> Self;

    fn to_isometry(&self) -> Iso3;
}

/// A pose representation usable for tags in a map.
pub trait TagPose: PoseAlgebra + Serialize + DeserializeOwned {
    const KIND: MapKind;

    /// Project a full rigid transform onto this representation.
    fn from_isometry(iso: &Iso3) -> Self;
}

/// In-plane rigid transform.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct Se2 {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Se2 {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self {
            x,
            y,
            heading: wrap_angle(heading),
        }
    }

    #[inline]
    fn rotate(&self, x: f64, y: f64) -> (f64, f64) {
        let (s, c) = self.heading.sin_cos();
        (c * x - s * y, s * x + c * y)
    }
}

impl From<[f64; 3]> for Se2 {
    fn from(v: [f64; 3]) -> Self {
        Se2::new(v[0], v[1], v[2])
    }
}

impl From<Se2> for [f64; 3] {
    fn from(p: Se2) -> Self {
        [p.x, p.y, p.heading]
    }
}

impl PoseAlgebra for Se2 {
    const DOF: usize = 3;

    fn identity() -> Self {
        Se2::new(0.0, 0.0, 0.0)
    }

    fn compose(&self, rhs: &Self) -> Self {
        let (rx, ry) = self.rotate(rhs.x, rhs.y);
        Se2::new(self.x + rx, self.y + ry, self.heading + rhs.heading)
    }

    fn inverse(&self) -> Self {
        let (s, c) = self.heading.sin_cos();
        Se2::new(
            -(c * self.x + s * self.y),
            -(-s * self.x + c * self.y),
            -self.heading,
        )
    }

    fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        let (rx, ry) = self.rotate(p.x, p.y);
        Point3::new(rx + self.x, ry + self.y, p.z)
    }

    fn perturb(&self, delta: &[f64]) -> Self {
        debug_assert_eq!(delta.len(), Self::DOF);
        Se2::new(
            self.x + delta[0],
            self.y + delta[1],
            self.heading + delta[2],
        )
    }

    fn to_isometry(&self) -> Iso3 {
        Iso3::from_parts(
            Translation3::new(self.x, self.y, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), self.heading),
        )
    }
}

impl TagPose for Se2 {
    const KIND: MapKind = MapKind::Planar;

    fn from_isometry(iso: &Iso3) -> Self {
        let t = iso.translation.vector;
        Se2::new(t.x, t.y, yaw_of(iso))
    }
}

/// In-plane rigid transform with a height offset along world z.
///
/// The height is translated additively and is never rotated: composing two
/// poses adds their heights.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Se2Height {
    pub planar: Se2,
    pub height: f64,
}

impl Se2Height {
    pub fn new(x: f64, y: f64, heading: f64, height: f64) -> Self {
        Self {
            planar: Se2::new(x, y, heading),
            height,
        }
    }
}

impl From<[f64; 4]> for Se2Height {
    fn from(v: [f64; 4]) -> Self {
        Se2Height::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Se2Height> for [f64; 4] {
    fn from(p: Se2Height) -> Self {
        [p.planar.x, p.planar.y, p.planar.heading, p.height]
    }
}

impl PoseAlgebra for Se2Height {
    const DOF: usize = 4;

    fn identity() -> Self {
        Se2Height::new(0.0, 0.0, 0.0, 0.0)
    }

    fn compose(&self, rhs: &Self) -> Self {
        Self {
            planar: self.planar.compose(&rhs.planar),
            height: self.height + rhs.height,
        }
    }

    fn inverse(&self) -> Self {
        Self {
            planar: self.planar.inverse(),
            height: -self.height,
        }
    }

    fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        let q = self.planar.transform_point(p);
        Point3::new(q.x, q.y, q.z + self.height)
    }

    fn perturb(&self, delta: &[f64]) -> Self {
        debug_assert_eq!(delta.len(), Self::DOF);
        Self {
            planar: self.planar.perturb(&delta[..3]),
            height: self.height + delta[3],
        }
    }

    fn to_isometry(&self) -> Iso3 {
        let mut iso = self.planar.to_isometry();
        iso.translation.vector.z = self.height;
        iso
    }
}

impl TagPose for Se2Height {
    const KIND: MapKind = MapKind::PlanarHeight;

    fn from_isometry(iso: &Iso3) -> Self {
        let t = iso.translation.vector;
        Se2Height::new(t.x, t.y, yaw_of(iso), t.z)
    }
}

/// Full 6-DOF rigid transform.
///
/// Serialized as a row-major homogeneous 4x4 matrix.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[[f64; 4]; 4]", into = "[[f64; 4]; 4]")]
pub struct Se3(pub Iso3);

impl Se3 {
    pub fn from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Se3(Iso3::from_parts(Translation3::from(translation), rotation))
    }

    #[inline]
    pub fn isometry(&self) -> &Iso3 {
        &self.0
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.0.translation.vector
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.0.to_homogeneous()
    }

    /// Build from a homogeneous matrix, re-orthonormalizing the rotation block.
    pub fn from_matrix(m: &Matrix4<f64>) -> Result<Self, PoseError> {
        if m.iter().any(|v| !v.is_finite()) {
            return Err(PoseError::NonFinite);
        }
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let det = r.determinant();
        if det <= 0.0 {
            return Err(PoseError::Reflection { det });
        }
        let rotation = Rotation3::from_matrix(&r);
        let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Ok(Se3::from_parts(
            UnitQuaternion::from_rotation_matrix(&rotation),
            t,
        ))
    }
}

impl From<Iso3> for Se3 {
    fn from(iso: Iso3) -> Self {
        Se3(iso)
    }
}

impl TryFrom<[[f64; 4]; 4]> for Se3 {
    type Error = PoseError;

    fn try_from(rows: [[f64; 4]; 4]) -> Result<Self, Self::Error> {
        Se3::from_matrix(&Matrix4::from_fn(|r, c| rows[r][c]))
    }
}

impl From<Se3> for [[f64; 4]; 4] {
    fn from(p: Se3) -> Self {
        let m = p.to_matrix();
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = m[(r, c)];
            }
        }
        rows
    }
}

impl PoseAlgebra for Se3 {
    const DOF: usize = 6;

    fn identity() -> Self {
        Se3(Iso3::identity())
    }

    fn compose(&self, rhs: &Self) -> Self {
        Se3(self.0 * rhs.0)
    }

    fn inverse(&self) -> Self {
        Se3(self.0.inverse())
    }

    fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.0.transform_point(p)
    }

    /// Right perturbation `self * exp([rho; omega])` with translation first.
    fn perturb(&self, delta: &[f64]) -> Self {
        debug_assert_eq!(delta.len(), Self::DOF);
        let step = Iso3::new(
            Vector3::new(delta[0], delta[1], delta[2]),
            Vector3::new(delta[3], delta[4], delta[5]),
        );
        Se3(self.0 * step)
    }

    fn to_isometry(&self) -> Iso3 {
        self.0
    }
}

impl TagPose for Se3 {
    const KIND: MapKind = MapKind::Spatial;

    fn from_isometry(iso: &Iso3) -> Self {
        Se3(*iso)
    }
}
