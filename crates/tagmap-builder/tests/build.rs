mod common;

use common::scene::{
    assert_iso_close, distance, height_tags, jitter, looking_down, planar_tags, spatial_tags,
    standard_viewpoints, tag_pose, Scene,
};
use std::collections::BTreeMap;
use tagmap_builder::{
    build_map, localize_viewpoint, ConvergencePolicy, DriverReport, EngineState, MapBuilder,
    MapBuilderParams, MapError, NodeRef, ViewpointObservations,
};
use tagmap_core::{Iso3, PnpParams, PoseAlgebra, Se2, Se2Height, Se3, TagPose};

fn run<P: TagPose>(scene: &Scene, viewpoints: &[ViewpointObservations]) -> DriverReport<P> {
    let mut builder: MapBuilder<P> =
        MapBuilder::new(scene.cameras(), scene.sizes(), MapBuilderParams::default());
    let report =
        build_map(&mut builder, viewpoints, &ConvergencePolicy::default()).expect("map builds");
    assert_eq!(builder.state(), EngineState::Converged);
    report
}

fn check_round_trip<P: TagPose>(scene: &Scene) {
    let viewpoints = scene.observe_standard();
    let report = run::<P>(scene, &viewpoints);

    assert!(report.converged, "driver hit the iteration cap");
    assert!(
        report.final_error < 1e-6,
        "final error {:.3e}",
        report.final_error
    );
    assert!(report.deferred.is_empty());
    assert_eq!(report.map.map_type, P::KIND);
    assert_eq!(report.map.len(), scene.tags.len());

    for (id, truth) in &scene.tags {
        let est = report.map.tag_locations[id].to_isometry();
        assert_iso_close(&est, truth, 1e-6, &format!("tag {id}"));
    }
    for (id, truth) in standard_viewpoints() {
        assert_iso_close(
            report.viewpoints[&id].isometry(),
            &truth,
            1e-6,
            &format!("viewpoint {id}"),
        );
    }
}

#[test]
fn noiseless_planar_map_matches_ground_truth() {
    check_round_trip::<Se2>(&Scene::new(planar_tags()));
}

#[test]
fn noiseless_height_map_matches_ground_truth() {
    check_round_trip::<Se2Height>(&Scene::new(height_tags()));
}

#[test]
fn noiseless_spatial_map_matches_ground_truth() {
    check_round_trip::<Se3>(&Scene::new(spatial_tags()));
}

fn check_gauge_change<P: TagPose>(scene: &Scene) {
    let views = standard_viewpoints();
    let first = scene.observe_standard();

    // start from viewpoint "c" and list tag 3 first so it becomes the anchor
    let mut second = vec![scene.observe("c", &views[2].1, &[3, 0, 1, 2, 4, 5])];
    second.extend(first.iter().filter(|v| v.id != "c").cloned());

    let a = run::<P>(scene, &first);
    let b = run::<P>(scene, &second);
    assert_eq!(b.map.tag_locations[&3], P::identity());

    let iso = |r: &DriverReport<P>, id: u32| r.map.tag_locations[&id].to_isometry();
    let gauge: Iso3 = iso(&b, 3) * iso(&a, 3).inverse();
    for id in scene.tags.keys() {
        assert_iso_close(
            &iso(&b, *id),
            &(gauge * iso(&a, *id)),
            1e-6,
            &format!("{} tag {id}", P::KIND),
        );
    }
    for (id, pose) in &a.viewpoints {
        assert_iso_close(
            b.viewpoints[id].isometry(),
            &(gauge * pose.isometry()),
            1e-6,
            &format!("{} viewpoint {id}", P::KIND),
        );
    }
}

#[test]
fn anchor_choice_only_changes_the_gauge_2d() {
    check_gauge_change::<Se2>(&Scene::new(planar_tags()));
}

#[test]
fn anchor_choice_only_changes_the_gauge_2_5d() {
    check_gauge_change::<Se2Height>(&Scene::new(height_tags()));
}

#[test]
fn anchor_choice_only_changes_the_gauge_3d() {
    check_gauge_change::<Se3>(&Scene::new(spatial_tags()));
}

#[test]
fn two_tags_one_metre_apart() {
    let scene = Scene::new(vec![
        (0, Iso3::identity()),
        (1, tag_pose(1.0, 0.0, 0.0, 0.0, 0.0, 0.0)),
    ]);
    let p = looking_down(0.5, 0.0, 2.0, 0.03, -0.02, 0.05);
    let q = looking_down(0.55, 0.05, 2.1, -0.04, 0.03, -0.08);
    let forward = vec![
        scene.observe("p", &p, &[0, 1]),
        scene.observe("q", &q, &[0, 1]),
    ];
    let backward = vec![
        scene.observe("q", &q, &[1, 0]),
        scene.observe("p", &p, &[0, 1]),
    ];

    for viewpoints in [forward, backward] {
        let report = run::<Se2>(&scene, &viewpoints);
        let t0 = report.map.tag_locations[&0].to_isometry();
        let t1 = report.map.tag_locations[&1].to_isometry();
        assert!((distance(&t0, &t1) - 1.0).abs() < 1e-6);
        let h0 = report.map.tag_locations[&0].heading;
        let h1 = report.map.tag_locations[&1].heading;
        assert!((h0 - h1).abs() < 1e-6);
    }
}

#[test]
fn disconnected_viewpoint_is_deferred_then_bridged() {
    let scene = Scene::new(vec![
        (0, Iso3::identity()),
        (1, tag_pose(0.5, 0.0, 0.0, 0.0, 0.0, 0.2)),
        (7, tag_pose(2.5, 0.0, 0.0, 0.0, 0.0, -0.3)),
        (8, tag_pose(3.0, 0.1, 0.0, 0.0, 0.0, 0.6)),
    ]);
    let home = scene.observe("home", &looking_down(0.25, 0.0, 1.5, 0.0, 0.0, 0.0), &[0, 1]);
    let island = scene.observe("island", &looking_down(2.75, 0.0, 1.5, 0.0, 0.0, 0.0), &[7, 8]);
    let bridge = scene.observe("bridge", &looking_down(1.5, 0.0, 3.0, 0.0, 0.0, 0.0), &[1, 7]);

    let mut builder: MapBuilder<Se2> =
        MapBuilder::new(scene.cameras(), scene.sizes(), MapBuilderParams::default());
    builder.add_viewpoint(&home).expect("home anchors the map");
    builder.relinearize();
    let tags_before = builder.tag_poses();
    let views_before = builder.viewpoint_poses();
    let error_before = builder.total_detection_error();

    assert_eq!(
        builder.add_viewpoint(&island),
        Err(MapError::DisconnectedNode {
            node: NodeRef::Viewpoint("island".into())
        })
    );
    assert_eq!(builder.tag_poses(), tags_before);
    assert_eq!(builder.viewpoint_poses(), views_before);
    assert_eq!(builder.total_detection_error(), error_before);
    assert_eq!(builder.pending_viewpoints(), vec!["island".to_string()]);
    assert_eq!(builder.pending_tags(), vec![7, 8]);

    builder.add_viewpoint(&bridge).expect("bridge connects");
    assert!(builder.pending_viewpoints().is_empty());
    assert!(builder.pending_tags().is_empty());
    assert!(builder.deferred().is_empty());

    let est = builder.tag_poses();
    for (id, truth) in &scene.tags {
        assert_iso_close(&est[id].to_isometry(), truth, 1e-6, &format!("tag {id}"));
    }
}

#[test]
fn driver_reports_deferred_viewpoints() {
    let scene = Scene::new(vec![
        (0, Iso3::identity()),
        (1, tag_pose(0.5, 0.0, 0.0, 0.0, 0.0, 0.2)),
        (9, tag_pose(5.0, 0.0, 0.0, 0.0, 0.0, 0.0)),
    ]);
    let viewpoints = vec![
        scene.observe("a", &looking_down(0.25, 0.0, 1.5, 0.0, 0.0, 0.0), &[0, 1]),
        scene.observe("lost", &looking_down(5.0, 0.0, 1.5, 0.0, 0.0, 0.0), &[9]),
        scene.observe("b", &looking_down(0.3, 0.1, 1.6, 0.05, 0.0, 0.1), &[0, 1]),
    ];
    let report = run::<Se2>(&scene, &viewpoints);
    assert!(report.converged);
    assert!(!report.viewpoints.contains_key("lost"));
    assert!(report
        .deferred
        .iter()
        .any(|(n, _)| *n == NodeRef::Viewpoint("lost".into())));
    assert!(report
        .deferred
        .iter()
        .any(|(n, _)| *n == NodeRef::Tag(9)));
}

#[test]
fn no_observations_means_no_anchor() {
    let scene = Scene::new(planar_tags());
    let mut builder: MapBuilder<Se2> =
        MapBuilder::new(scene.cameras(), scene.sizes(), MapBuilderParams::default());
    let empty = vec![ViewpointObservations::new("x", 0)];
    assert_eq!(
        build_map(&mut builder, &empty, &ConvergencePolicy::default()).err(),
        Some(MapError::NoAnchor)
    );
    assert_eq!(
        build_map(&mut builder, &[], &ConvergencePolicy::default()).err(),
        Some(MapError::NoAnchor)
    );
}

#[test]
fn committed_error_never_increases_under_noise() {
    let scene = Scene::new(height_tags());
    let mut builder: MapBuilder<Se2Height> =
        MapBuilder::new(scene.cameras(), scene.sizes(), MapBuilderParams::default());
    for (i, vp) in scene.observe_standard().into_iter().enumerate() {
        builder
            .add_viewpoint(&jitter(vp, 0.8, 17 + i as u64))
            .expect("connected");
    }
    builder.relinearize();

    let initial = builder.total_detection_error();
    let mut prev = initial;
    for _ in 0..15 {
        for _ in 0..20 {
            builder.send_tag_to_viewpoint();
            builder.send_viewpoint_to_tag();
        }
        builder.update();
        let err = builder.total_detection_error();
        assert!(err <= prev, "error grew from {prev} to {err}");
        prev = err;
    }
    assert!(prev < initial, "no progress from {initial}");
    assert_eq!(builder.tag_poses()[&0], Se2Height::identity());
}

#[test]
fn relinearize_then_update_is_idempotent() {
    let scene = Scene::new(height_tags());
    let mut builder: MapBuilder<Se2Height> =
        MapBuilder::new(scene.cameras(), scene.sizes(), MapBuilderParams::default());
    for (i, vp) in scene.observe_standard().into_iter().enumerate() {
        builder
            .add_viewpoint(&jitter(vp, 0.5, 3 + i as u64))
            .expect("connected");
    }
    for _ in 0..3 {
        builder.relinearize();
        let tags = builder.tag_poses();
        let views = builder.viewpoint_poses();
        let error = builder.total_detection_error();

        assert!(builder.update());
        assert_eq!(builder.tag_poses(), tags);
        assert_eq!(builder.viewpoint_poses(), views);
        assert_eq!(builder.total_detection_error(), error);

        for _ in 0..20 {
            builder.send_tag_to_viewpoint();
            builder.send_viewpoint_to_tag();
        }
        builder.update();
    }
}

#[test]
fn localizes_new_capture_against_finished_map() {
    let scene = Scene::new(spatial_tags());
    let report = run::<Se3>(&scene, &scene.observe_standard());

    let truth = looking_down(0.7, 0.1, 1.9, 0.07, -0.05, 0.3);
    let capture = scene.observe_all("query", &truth);
    let loc = localize_viewpoint(&report.map, &capture, &scene.camera, &PnpParams::default())
        .expect("localized");
    assert_iso_close(loc.world_from_viewpoint.isometry(), &truth, 1e-6, "query");
    assert_eq!(loc.tags_used.len(), capture.tags.len());

    let unknown = ViewpointObservations::new("stranger", 0).with_tag(42, capture.tags[0].corners);
    assert!(matches!(
        localize_viewpoint(&report.map, &unknown, &scene.camera, &PnpParams::default()),
        Err(MapError::DisconnectedNode { .. })
    ));
}

#[test]
fn map_lists_every_estimated_tag() {
    let scene = Scene::new(planar_tags());
    let report = run::<Se2>(&scene, &scene.observe_standard());
    let ids: Vec<u32> = report.map.tag_locations.keys().copied().collect();
    assert_eq!(ids, scene.tags.keys().copied().collect::<Vec<_>>());
    let headings: BTreeMap<u32, f64> = report
        .map
        .tag_locations
        .iter()
        .map(|(id, p)| (*id, p.heading))
        .collect();
    assert!((headings[&4] - 3.0).abs() < 1e-6);
}
