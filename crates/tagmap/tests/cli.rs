use assert_cmd::Command;
use nalgebra::{Translation3, UnitQuaternion};
use predicates::prelude::*;
use std::f64::consts::PI;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tagmap::core::{tag_corners, CameraIntrinsics, Iso3};

const SIDE: f64 = 0.2;

fn camera() -> CameraIntrinsics {
    CameraIntrinsics::pinhole(800.0, 800.0, 640.0, 360.0).expect("camera")
}

fn tags() -> Vec<(u32, Iso3)> {
    let at = |x: f64, y: f64, heading: f64| {
        Iso3::from_parts(
            Translation3::new(x, y, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, heading),
        )
    };
    vec![
        (0, Iso3::identity()),
        (1, at(0.5, 0.0, 0.3)),
        (2, at(1.0, 0.05, -0.4)),
        (3, at(0.0, 0.5, 1.2)),
        (4, at(0.5, 0.5, 3.0)),
    ]
}

/// File name and `world_from_viewpoint` of each capture.
fn captures() -> Vec<(&'static str, Iso3)> {
    let down = |x: f64, y: f64, z: f64, tx: f64, ty: f64, yaw: f64| {
        Iso3::from_parts(
            Translation3::new(x, y, z),
            UnitQuaternion::from_euler_angles(PI + tx, ty, yaw),
        )
    };
    vec![
        ("tags_1.txt", down(0.4, 0.2, 2.0, 0.05, -0.04, 0.1)),
        ("tags_2.txt", down(0.6, 0.3, 2.2, -0.08, 0.06, -0.2)),
        ("tags_10.txt", down(0.5, 0.25, 2.3, 0.1, 0.1, 0.15)),
        ("tags_0_3.txt", down(0.45, 0.3, 2.0, -0.05, -0.1, -0.1)),
    ]
}

fn write_data_dir(dir: &Path) {
    fs::write(
        dir.join("config.json"),
        r#"{
  "cameras": [{"camera_matrix": [[800, 0, 640], [0, 800, 360], [0, 0, 1]]}],
  "tag_side_length": 0.2
}"#,
    )
    .expect("config");

    let camera = camera();
    for (name, world_from_view) in captures() {
        let mut text = String::new();
        for (id, world_from_tag) in tags() {
            let camera_from_tag = world_from_view.inverse() * world_from_tag;
            writeln!(text, "{id}").expect("fmt");
            for c in tag_corners(SIDE) {
                let p = camera
                    .project(&camera_from_tag.transform_point(&c))
                    .expect("in front");
                writeln!(text, "{} {}", p.x, p.y).expect("fmt");
            }
            text.push('\n');
        }
        fs::write(dir.join(name), text).expect("tags");
    }
}

fn tagmap() -> Command {
    Command::cargo_bin("tagmap").expect("binary")
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

#[test]
fn build_writes_map_and_viewpoints() {
    let input = tempfile::tempdir().expect("tempdir");
    let output = tempfile::tempdir().expect("tempdir");
    write_data_dir(input.path());
    let out_dir = output.path().join("run");

    tagmap()
        .args(["--log-level", "warn", "build", "--mode", "2d"])
        .arg("--input-data-dir")
        .arg(input.path())
        .arg("--output-data-dir")
        .arg(&out_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("map.json"));

    let map = read_json(&out_dir.join("map.json"));
    assert_eq!(map["map_type"], "2d");
    assert_eq!(map["tag_side_lengths"]["default"], 0.2);
    let tag3 = &map["tag_locations"]["3"];
    let tag3: Vec<f64> = (0..3).map(|i| tag3[i].as_f64().expect("number")).collect();
    assert!((tag3[0] - 0.0).abs() < 1e-4, "{tag3:?}");
    assert!((tag3[1] - 0.5).abs() < 1e-4, "{tag3:?}");
    assert!((tag3[2] - 1.2).abs() < 1e-4, "{tag3:?}");

    let views = read_json(&out_dir.join("viewpoints.json"));
    let ids: Vec<&str> = views
        .as_object()
        .expect("object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(ids.len(), 4);
    for id in ["1", "2", "3", "10"] {
        assert!(ids.contains(&id), "missing viewpoint {id}");
    }
    let z = views["10"][2][3].as_f64().expect("number");
    assert!((z - 2.3).abs() < 1e-4, "height {z}");
}

#[test]
fn localize_places_captures_in_built_map() {
    let input = tempfile::tempdir().expect("tempdir");
    let output = tempfile::tempdir().expect("tempdir");
    write_data_dir(input.path());

    tagmap()
        .arg("build")
        .arg("--input-data-dir")
        .arg(input.path())
        .arg("--output-data-dir")
        .arg(output.path())
        .assert()
        .success();

    let located = output.path().join("located.json");
    tagmap()
        .arg("localize")
        .arg("--map-dir")
        .arg(output.path())
        .arg("--input-data-dir")
        .arg(input.path())
        .arg("--output")
        .arg(&located)
        .assert()
        .success();

    let json = read_json(&located);
    let x = json["2"]["world_from_viewpoint"][0][3].as_f64().expect("number");
    assert!((x - 0.6).abs() < 1e-4, "x {x}");
    assert_eq!(json["2"]["tags_used"].as_array().map(Vec::len), Some(5));
}

#[test]
fn params_file_overrides_iteration_cap() {
    let input = tempfile::tempdir().expect("tempdir");
    let output = tempfile::tempdir().expect("tempdir");
    write_data_dir(input.path());
    let params = output.path().join("params.json");
    fs::write(&params, r#"{"convergence": {"max_iterations": 2}}"#).expect("params");

    tagmap()
        .arg("build")
        .arg("--input-data-dir")
        .arg(input.path())
        .arg("--output-data-dir")
        .arg(output.path())
        .arg("--params")
        .arg(&params)
        .assert()
        .success()
        .stderr(predicate::str::contains("without converging"));

    // two iterations add only the first capture
    let views = read_json(&output.path().join("viewpoints.json"));
    assert_eq!(views.as_object().map(|o| o.len()), Some(1));
}

#[test]
fn missing_config_is_reported() {
    let input = tempfile::tempdir().expect("tempdir");
    let output = tempfile::tempdir().expect("tempdir");

    tagmap()
        .arg("build")
        .arg("--input-data-dir")
        .arg(input.path())
        .arg("--output-data-dir")
        .arg(output.path())
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("error:"));
}

#[test]
fn unknown_mode_is_rejected() {
    tagmap()
        .args(["build", "--input-data-dir", ".", "--output-data-dir", "."])
        .args(["--mode", "4d"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("4d"));
}
