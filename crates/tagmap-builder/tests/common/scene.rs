//! Synthetic tag scenes with exact (or jittered) corner projections.

use nalgebra::{Point2, Translation3, UnitQuaternion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tagmap_builder::{TagSizes, ViewpointObservations};
use tagmap_core::{tag_corners, CameraId, CameraIntrinsics, Iso3, TagId};

pub const WIDTH: f64 = 1280.0;
pub const HEIGHT: f64 = 720.0;
pub const SIDE: f64 = 0.2;

pub fn camera() -> CameraIntrinsics {
    CameraIntrinsics::pinhole(800.0, 800.0, 640.0, 360.0).expect("camera")
}

/// Camera above the tag plane looking roughly straight down.
pub fn looking_down(x: f64, y: f64, z: f64, tilt_x: f64, tilt_y: f64, yaw: f64) -> Iso3 {
    Iso3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_euler_angles(std::f64::consts::PI + tilt_x, tilt_y, yaw),
    )
}

pub fn tag_pose(x: f64, y: f64, z: f64, roll: f64, pitch: f64, heading: f64) -> Iso3 {
    Iso3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_euler_angles(roll, pitch, heading),
    )
}

/// Six tags on the `z = 0` plane; tag 0 defines the world frame.
pub fn planar_tags() -> Vec<(TagId, Iso3)> {
    vec![
        (0, Iso3::identity()),
        (1, tag_pose(0.5, 0.0, 0.0, 0.0, 0.0, 0.3)),
        (2, tag_pose(1.0, 0.05, 0.0, 0.0, 0.0, -0.4)),
        (3, tag_pose(0.0, 0.5, 0.0, 0.0, 0.0, 1.2)),
        (4, tag_pose(0.5, 0.5, 0.0, 0.0, 0.0, 3.0)),
        (5, tag_pose(1.0, 0.45, 0.0, 0.0, 0.0, -2.0)),
    ]
}

/// Level tags at different heights.
pub fn height_tags() -> Vec<(TagId, Iso3)> {
    let heights = [0.0, 0.04, -0.03, 0.06, 0.0, 0.02];
    planar_tags()
        .into_iter()
        .zip(heights)
        .map(|((id, mut pose), h)| {
            pose.translation.vector.z = h;
            (id, pose)
        })
        .collect()
}

/// Tilted tags at different heights.
pub fn spatial_tags() -> Vec<(TagId, Iso3)> {
    vec![
        (0, Iso3::identity()),
        (1, tag_pose(0.5, 0.0, 0.05, 0.2, -0.1, 0.3)),
        (2, tag_pose(1.0, 0.05, -0.02, -0.15, 0.1, -0.4)),
        (3, tag_pose(0.0, 0.5, 0.08, 0.1, 0.25, 1.2)),
        (4, tag_pose(0.5, 0.5, 0.0, -0.2, -0.2, 3.0)),
        (5, tag_pose(1.0, 0.45, 0.03, 0.0, 0.15, -2.0)),
    ]
}

/// Four captures that all see the 1.0 m x 0.5 m tag field.
pub fn standard_viewpoints() -> Vec<(String, Iso3)> {
    vec![
        ("a".into(), looking_down(0.4, 0.2, 2.0, 0.05, -0.04, 0.1)),
        ("b".into(), looking_down(0.6, 0.3, 2.2, -0.08, 0.06, -0.2)),
        ("c".into(), looking_down(0.5, 0.25, 2.3, 0.1, 0.1, 0.15)),
        ("d".into(), looking_down(0.45, 0.3, 2.0, -0.05, -0.1, -0.1)),
    ]
}

pub struct Scene {
    pub camera: CameraIntrinsics,
    pub tags: BTreeMap<TagId, Iso3>,
}

impl Scene {
    pub fn new(tags: impl IntoIterator<Item = (TagId, Iso3)>) -> Self {
        Self {
            camera: camera(),
            tags: tags.into_iter().collect(),
        }
    }

    pub fn cameras(&self) -> BTreeMap<CameraId, CameraIntrinsics> {
        let mut cameras = BTreeMap::new();
        cameras.insert(0, self.camera.clone());
        cameras
    }

    pub fn sizes(&self) -> TagSizes {
        TagSizes::uniform(SIDE).expect("side length")
    }

    fn project(&self, world_from_viewpoint: &Iso3, tag: TagId) -> Option<[Point2<f64>; 4]> {
        let world_from_tag = self.tags.get(&tag)?;
        let camera_from_tag = world_from_viewpoint.inverse() * world_from_tag;
        let mut out = [Point2::origin(); 4];
        for (px, c) in out.iter_mut().zip(tag_corners(SIDE).iter()) {
            let p = self.camera.project(&camera_from_tag.transform_point(c))?;
            if !(0.0..WIDTH).contains(&p.x) || !(0.0..HEIGHT).contains(&p.y) {
                return None;
            }
            *px = p;
        }
        Some(out)
    }

    /// Exact observations of `tags`, in the given order. Panics if one is not visible.
    pub fn observe(
        &self,
        id: &str,
        world_from_viewpoint: &Iso3,
        tags: &[TagId],
    ) -> ViewpointObservations {
        tags.iter().fold(ViewpointObservations::new(id, 0), |vp, &tag| {
            let corners = self
                .project(world_from_viewpoint, tag)
                .unwrap_or_else(|| panic!("tag {tag} not visible from {id}"));
            vp.with_tag(tag, corners)
        })
    }

    /// Exact observations of every visible tag, in ascending id order.
    pub fn observe_all(&self, id: &str, world_from_viewpoint: &Iso3) -> ViewpointObservations {
        let visible: Vec<TagId> = self
            .tags
            .keys()
            .copied()
            .filter(|&t| self.project(world_from_viewpoint, t).is_some())
            .collect();
        self.observe(id, world_from_viewpoint, &visible)
    }

    pub fn observe_standard(&self) -> Vec<ViewpointObservations> {
        standard_viewpoints()
            .iter()
            .map(|(id, pose)| self.observe_all(id, pose))
            .collect()
    }
}

/// Deterministic corner jitter, uniform in `[-amplitude, amplitude]`.
pub fn jitter(
    mut vp: ViewpointObservations,
    amplitude: f64,
    seed: u64,
) -> ViewpointObservations {
    let mut rng = StdRng::seed_from_u64(seed);
    for obs in &mut vp.tags {
        for c in &mut obs.corners {
            c.x += rng.random_range(-amplitude..=amplitude);
            c.y += rng.random_range(-amplitude..=amplitude);
        }
    }
    vp
}

pub fn assert_iso_close(actual: &Iso3, expected: &Iso3, tol: f64, what: &str) {
    let dt = (actual.translation.vector - expected.translation.vector).norm();
    let dr = actual.rotation.angle_to(&expected.rotation);
    assert!(
        dt < tol && dr < tol,
        "{what}: translation off by {dt:.3e}, rotation off by {dr:.3e}"
    );
}

pub fn distance(a: &Iso3, b: &Iso3) -> f64 {
    (a.translation.vector - b.translation.vector).norm()
}
