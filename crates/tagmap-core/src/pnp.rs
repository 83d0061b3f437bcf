//! Perspective pose recovery from planar tag corners.
//!
//! The solver seeds from the plane-induced homography of the tag with the
//! largest image footprint, then refines the pose over every correspondence
//! with Levenberg-Marquardt. The final Jacobian doubles as the conditioning
//! check for degenerate geometry.

use crate::camera::CameraIntrinsics;
use crate::diff::central_difference;
use crate::homography::homography_from_4pt;
use crate::pose::{Iso3, PoseAlgebra, Se3};
use crate::tag::{corner_spread, quad_area, tag_corners};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{
    storage::Owned, DMatrix, DVector, Dyn, Matrix3, Point2, Point3, Rotation3, Translation3,
    UnitQuaternion,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Four corners of one planar tag already suffice.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Failures of the perspective solver.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PnpError {
    #[error("need at least {required} point correspondences, got {found}")]
    InsufficientCorrespondences { found: usize, required: usize },
    #[error("tag footprint of {area:.3} px^2 is below {min:.3} px^2")]
    FootprintTooSmall { area: f64, min: f64 },
    #[error("tag corners are nearly collinear (spread {spread:.3e} below {min:.3e})")]
    CollinearCorners { spread: f64, min: f64 },
    #[error("plane homography could not be estimated from the tag corners")]
    HomographyFailed,
    #[error("pose is ill-conditioned (reciprocal condition number {rcond:.3e})")]
    IllConditioned { rcond: f64 },
    #[error("reprojection error of {rms_px:.3} px exceeds {max:.3} px")]
    ReprojectionTooLarge { rms_px: f64, max: f64 },
    #[error("correspondences project behind the camera")]
    BehindCamera,
}

/// Configuration for [`solve_tag_pnp`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PnpParams {
    /// Levenberg-Marquardt patience; residual evaluations are capped at
    /// `max_iterations * 7`.
    pub max_iterations: usize,
    /// Smallest image footprint (px^2) of the seeding tag.
    pub min_footprint_px2: f64,
    /// Smallest accepted corner spread of the seeding tag, see
    /// [`corner_spread`](crate::corner_spread).
    pub min_corner_spread: f64,
    /// Smallest accepted reciprocal condition number of the 6x6 normal equations.
    pub min_rcond: f64,
    /// Largest accepted RMS reprojection error at the solution.
    pub max_rms_px: f64,
    /// Central-difference step in tangent units.
    pub jacobian_step: f64,
}

impl Default for PnpParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            min_footprint_px2: 1.0,
            min_corner_spread: 1e-3,
            min_rcond: 1e-12,
            max_rms_px: 10.0,
            jacobian_step: 1e-6,
        }
    }
}

/// One observed tag with a known pose in the target frame.
#[derive(Clone, Debug)]
pub struct TagView {
    pub world_from_tag: Iso3,
    pub side_length: f64,
    /// Observed pixel corners in detector winding order.
    pub corners: [Point2<f64>; 4],
}

#[derive(Clone, Debug)]
pub struct PnpSolution {
    pub camera_from_world: Iso3,
    /// Root-mean-square pixel error per corner at the solution.
    pub rms_px: f64,
    /// Reciprocal condition number of the final normal equations.
    pub rcond: f64,
}

/// Decompose a homography mapping the tag plane (`z = 0`) to normalized
/// image coordinates into `camera_from_tag`.
///
/// The scale sign is chosen so the tag lies in front of the camera.
pub fn planar_pose_from_homography(h: &Matrix3<f64>) -> Option<Iso3> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm_sum = h1.norm() + h2.norm();
    if norm_sum < 1e-12 {
        return None;
    }
    let mut lambda = 2.0 / norm_sum;
    if lambda * h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // Project onto SO(3)
    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r_orth = u_fix * v_t;
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Some(Iso3::from_parts(Translation3::from(h3 * lambda), rotation))
}

fn seed_camera_from_tag(camera: &CameraIntrinsics, view: &TagView) -> Result<Iso3, PnpError> {
    let plane = tag_corners(view.side_length).map(|p| Point2::new(p.x, p.y));
    let image = view.corners.map(|px| {
        let n = camera.normalize(&px);
        Point2::new(n.x, n.y)
    });
    let h = homography_from_4pt(&plane, &image).ok_or(PnpError::HomographyFailed)?;
    planar_pose_from_homography(&h.h).ok_or(PnpError::HomographyFailed)
}

/// Recover `camera_from_world` from one or more tags with known world poses.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip(camera, views, params), fields(tags = views.len()))
)]
pub fn solve_tag_pnp(
    camera: &CameraIntrinsics,
    views: &[TagView],
    params: &PnpParams,
) -> Result<PnpSolution, PnpError> {
    let found = views.len() * 4;
    if found < MIN_CORRESPONDENCES {
        return Err(PnpError::InsufficientCorrespondences {
            found,
            required: MIN_CORRESPONDENCES,
        });
    }

    let mut seed = &views[0];
    let mut seed_area = quad_area(&seed.corners);
    for view in &views[1..] {
        let area = quad_area(&view.corners);
        if area > seed_area {
            seed = view;
            seed_area = area;
        }
    }
    if seed_area < params.min_footprint_px2 {
        return Err(PnpError::FootprintTooSmall {
            area: seed_area,
            min: params.min_footprint_px2,
        });
    }
    let spread = corner_spread(&seed.corners);
    if !(spread >= params.min_corner_spread) {
        return Err(PnpError::CollinearCorners {
            spread,
            min: params.min_corner_spread,
        });
    }

    let camera_from_tag = seed_camera_from_tag(camera, seed)?;
    let initial = camera_from_tag * seed.world_from_tag.inverse();

    let mut object = Vec::with_capacity(found);
    let mut pixels = Vec::with_capacity(found);
    for view in views {
        for (corner, px) in tag_corners(view.side_length).iter().zip(view.corners.iter()) {
            object.push(view.world_from_tag.transform_point(corner));
            pixels.push(*px);
        }
    }

    refine_pose(camera, &object, &pixels, Se3(initial), params)
}

/// Recover `camera_from_tag` from the four corners of a single tag.
pub fn tag_pose_in_camera(
    camera: &CameraIntrinsics,
    side_length: f64,
    corners: &[Point2<f64>; 4],
    params: &PnpParams,
) -> Result<PnpSolution, PnpError> {
    let view = TagView {
        world_from_tag: Iso3::identity(),
        side_length,
        corners: *corners,
    };
    solve_tag_pnp(camera, std::slice::from_ref(&view), params)
}

fn reprojection_residuals(
    camera: &CameraIntrinsics,
    object: &[Point3<f64>],
    pixels: &[Point2<f64>],
    camera_from_world: &Se3,
) -> Option<DVector<f64>> {
    let mut r = DVector::zeros(2 * object.len());
    for (i, (x, u)) in object.iter().zip(pixels).enumerate() {
        let p = camera.project(&camera_from_world.transform_point(x))?;
        r[2 * i] = p.x - u.x;
        r[2 * i + 1] = p.y - u.y;
    }
    Some(r)
}

/// Pose refinement as a least-squares problem over a tangent delta
/// around the seed pose.
struct PoseProblem<'a> {
    camera: &'a CameraIntrinsics,
    object: &'a [Point3<f64>],
    pixels: &'a [Point2<f64>],
    seed: Se3,
    delta: DVector<f64>,
    step: f64,
}

impl PoseProblem<'_> {
    fn pose(&self) -> Se3 {
        self.seed.perturb(self.delta.as_slice())
    }

    fn residuals_at(&self, delta: &[f64]) -> Option<DVector<f64>> {
        let pose = self.seed.perturb(delta);
        reprojection_residuals(self.camera, self.object, self.pixels, &pose)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.delta.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.delta.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residuals_at(self.delta.as_slice())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut at = self.delta.clone();
        central_difference(Se3::DOF, self.step, |d| {
            for (k, v) in d.iter().enumerate() {
                at[k] = self.delta[k] + v;
            }
            self.residuals_at(at.as_slice())
        })
    }
}

/// Levenberg-Marquardt refinement of `camera_from_world` over point
/// correspondences.
pub fn refine_pose(
    camera: &CameraIntrinsics,
    object: &[Point3<f64>],
    pixels: &[Point2<f64>],
    initial: Se3,
    params: &PnpParams,
) -> Result<PnpSolution, PnpError> {
    if object.len() != pixels.len() || object.len() < MIN_CORRESPONDENCES {
        return Err(PnpError::InsufficientCorrespondences {
            found: object.len().min(pixels.len()),
            required: MIN_CORRESPONDENCES,
        });
    }

    let problem = PoseProblem {
        camera,
        object,
        pixels,
        seed: initial,
        delta: DVector::zeros(Se3::DOF),
        step: params.jacobian_step,
    };
    problem.residuals().ok_or(PnpError::BehindCamera)?;

    let lm = LevenbergMarquardt::new().with_patience(params.max_iterations.max(1));
    let (problem, report) = lm.minimize(problem);
    if !report.termination.was_successful() {
        log::debug!("pnp stopped early: {:?}", report.termination);
    }

    let r = problem.residuals().ok_or(PnpError::BehindCamera)?;
    let cost = r.norm_squared();
    let j = problem.jacobian().ok_or(PnpError::BehindCamera)?;
    let eig = (j.transpose() * &j).symmetric_eigenvalues();
    let max = eig.max();
    let rcond = if max > 0.0 { eig.min().max(0.0) / max } else { 0.0 };
    if !(rcond >= params.min_rcond) {
        return Err(PnpError::IllConditioned { rcond });
    }

    let rms_px = (cost / object.len() as f64).sqrt();
    if !(rms_px <= params.max_rms_px) {
        return Err(PnpError::ReprojectionTooLarge {
            rms_px,
            max: params.max_rms_px,
        });
    }

    log::debug!(
        "pnp converged: {} correspondences, {} evaluations, rms {:.3e} px, rcond {:.3e}",
        object.len(),
        report.number_of_evaluations,
        rms_px,
        rcond
    );

    Ok(PnpSolution {
        camera_from_world: problem.pose().0,
        rms_px,
        rcond,
    })
}
