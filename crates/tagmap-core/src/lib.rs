//! Geometric building blocks for fiducial tag mapping.
//!
//! Pose representations for the three map variants, a pinhole camera with
//! Brown-Conrady distortion, plane homographies and a multi-tag perspective
//! pose solver. Nothing here knows about observation graphs or files.

mod camera;
mod diff;
mod homography;
mod logger;
mod pnp;
mod pose;
mod tag;

pub use camera::{BrownConrady, CameraError, CameraId, CameraIntrinsics};
pub use diff::central_difference;
pub use homography::{homography_from_4pt, Homography};
pub use pnp::{
    planar_pose_from_homography, refine_pose, solve_tag_pnp, tag_pose_in_camera, PnpError,
    PnpParams, PnpSolution, TagView, MIN_CORRESPONDENCES,
};
pub use pose::{
    wrap_angle, Iso3, MapKind, PoseAlgebra, PoseError, Se2, Se2Height, Se3, TagPose,
};
pub use tag::{corner_spread, quad_area, tag_corners, TagId};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
