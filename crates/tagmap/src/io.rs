//! On-disk formats of a mapping run.
//!
//! Input is a data directory with a `config.json` (cameras and tag sizes) and
//! one `tags_<viewpoint>.txt` or `tags_<camera>_<viewpoint>.txt` file per
//! capture. Output is `map.json` and `viewpoints.json` in an output directory.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::Point2;
use tagmap_builder::{
    ConvergencePolicy, MapBuilderParams, TagMap, TagObservation, TagSizeError, TagSizes,
    ViewpointId, ViewpointObservations, ViewpointPoses, DEFAULT_SIZE_KEY,
};
use tagmap_core::{
    BrownConrady, CameraError, CameraId, CameraIntrinsics, MapKind, TagId, TagPose,
};

pub const CONFIG_FILE: &str = "config.json";
pub const MAP_FILE: &str = "map.json";
pub const VIEWPOINTS_FILE: &str = "viewpoints.json";

#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("viewpoint `{0}` appears in more than one tag file")]
    DuplicateViewpoint(ViewpointId),
    #[error("camera {index} in config: {source}")]
    InvalidCamera { index: usize, source: CameraError },
    #[error("camera id {0} is listed twice in config")]
    DuplicateCamera(CameraId),
    #[error("tag sizes: {0}")]
    TagSize(#[from] TagSizeError),
    #[error("map is `{found}`, expected `{expected}`")]
    MapType { expected: MapKind, found: MapKind },
}

/// Read and deserialize a JSON file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, DataError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Serialize `value` as pretty JSON into `path`.
pub fn write_json<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), DataError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

/// One entry of the `cameras` list in `config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Defaults to the position in the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CameraId>,
    pub camera_matrix: [[f64; 3]; 3],
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distortion_coefficients: Vec<f64>,
}

impl CameraConfig {
    pub fn intrinsics(&self) -> Result<CameraIntrinsics, CameraError> {
        let distortion = BrownConrady::from_coefficients(&self.distortion_coefficients)?;
        Ok(CameraIntrinsics::from_rows(self.camera_matrix)?.with_distortion(distortion))
    }
}

/// Contents of `config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub cameras: Vec<CameraConfig>,
    pub tag_side_length: f64,
    /// Per-tag side lengths keyed by tag id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tag_side_lengths: BTreeMap<String, f64>,
}

impl DataConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, DataError> {
        load_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), DataError> {
        write_json(path, self)
    }

    /// Validated intrinsics keyed by camera id.
    pub fn cameras(&self) -> Result<BTreeMap<CameraId, CameraIntrinsics>, DataError> {
        let mut out = BTreeMap::new();
        for (index, cam) in self.cameras.iter().enumerate() {
            let id = cam.id.unwrap_or(index as CameraId);
            let intrinsics = cam
                .intrinsics()
                .map_err(|source| DataError::InvalidCamera { index, source })?;
            if out.insert(id, intrinsics).is_some() {
                return Err(DataError::DuplicateCamera(id));
            }
        }
        Ok(out)
    }

    /// `tag_side_length` is the default; `tag_side_lengths` adds per-id
    /// overrides and may not carry a `default` key of its own.
    pub fn tag_sizes(&self) -> Result<TagSizes, DataError> {
        let mut raw = self.tag_side_lengths.clone();
        if raw.contains_key(DEFAULT_SIZE_KEY) {
            return Err(TagSizeError::ReservedKey(DEFAULT_SIZE_KEY.to_string()).into());
        }
        raw.insert(DEFAULT_SIZE_KEY.to_string(), self.tag_side_length);
        Ok(TagSizes::try_from(raw)?)
    }
}

/// Optional parameter overrides for `tagmap build --params`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub builder: MapBuilderParams,
    pub convergence: ConvergencePolicy,
}

impl BuildConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, DataError> {
        load_json(path)
    }
}

/// Everything loaded from a data directory.
#[derive(Clone, Debug)]
pub struct DataSet {
    pub cameras: BTreeMap<CameraId, CameraIntrinsics>,
    pub tag_sizes: TagSizes,
    /// Sorted by viewpoint id, see [`compare_viewpoint_ids`].
    pub viewpoints: Vec<ViewpointObservations>,
}

/// Parse the body of a tag file.
///
/// The format is a sequence of blocks, each one tag id line followed by four
/// `x y` corner lines. Blank lines are ignored anywhere.
pub fn parse_tag_file(text: &str, path: &Path) -> Result<Vec<TagObservation>, DataError> {
    let err = |line: usize, message: String| DataError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());
    let mut tags = Vec::new();

    while let Some((line, raw_id)) = lines.next() {
        let tag_id: TagId = raw_id
            .parse()
            .map_err(|_| err(line, format!("expected a tag id, found `{raw_id}`")))?;

        let mut corners = [Point2::origin(); 4];
        let mut last = line;
        for (k, corner) in corners.iter_mut().enumerate() {
            let Some((line, raw)) = lines.next() else {
                return Err(err(
                    last,
                    format!("tag {tag_id}: expected 4 corner lines, found {k}"),
                ));
            };
            *corner = parse_corner(raw).ok_or_else(|| {
                err(line, format!("tag {tag_id}: expected `x y`, found `{raw}`"))
            })?;
            last = line;
        }
        tags.push(TagObservation { tag_id, corners });
    }
    Ok(tags)
}

fn parse_corner(raw: &str) -> Option<Point2<f64>> {
    let mut it = raw.split_whitespace().map(str::parse::<f64>);
    let x = it.next()?.ok()?;
    let y = it.next()?.ok()?;
    if it.next().is_some() || !x.is_finite() || !y.is_finite() {
        return None;
    }
    Some(Point2::new(x, y))
}

/// Split a tag file name into `(camera, viewpoint)`.
///
/// `tags_12` is viewpoint `12` of camera 0; `tags_1_12` is viewpoint `12` of
/// camera 1. A prefix that is not a camera id stays part of the viewpoint id.
pub fn parse_tag_file_name(file_name: &str) -> Option<(CameraId, ViewpointId)> {
    let rest = file_name.strip_prefix("tags_")?.strip_suffix(".txt")?;
    if rest.is_empty() {
        return None;
    }
    if let Some((cam, view)) = rest.split_once('_') {
        if let (Ok(cam), false) = (cam.parse::<CameraId>(), view.is_empty()) {
            return Some((cam, view.to_string()));
        }
    }
    Some((0, rest.to_string()))
}

/// Numeric ids first in numeric order, then the rest lexically.
pub fn compare_viewpoint_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Load every tag file of a directory, sorted by viewpoint id.
pub fn load_viewpoints(dir: impl AsRef<Path>) -> Result<Vec<ViewpointObservations>, DataError> {
    let dir = dir.as_ref();
    let mut by_id: BTreeMap<ViewpointId, ViewpointObservations> = BTreeMap::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some((camera, id)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_tag_file_name)
        else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        let tags = parse_tag_file(&text, &path)?;
        log::debug!("{}: {} tags", path.display(), tags.len());
        if by_id.contains_key(&id) {
            return Err(DataError::DuplicateViewpoint(id));
        }
        by_id.insert(id.clone(), ViewpointObservations { id, camera, tags });
    }

    let mut viewpoints: Vec<_> = by_id.into_values().collect();
    viewpoints.sort_by(|a, b| compare_viewpoint_ids(&a.id, &b.id));
    Ok(viewpoints)
}

/// Load `config.json` and all tag files of a data directory.
pub fn load_data_dir(dir: impl AsRef<Path>) -> Result<DataSet, DataError> {
    let dir = dir.as_ref();
    let config = DataConfig::load_json(dir.join(CONFIG_FILE))?;
    let data = DataSet {
        cameras: config.cameras()?,
        tag_sizes: config.tag_sizes()?,
        viewpoints: load_viewpoints(dir)?,
    };
    log::info!(
        "loaded {} cameras and {} viewpoints from {}",
        data.cameras.len(),
        data.viewpoints.len(),
        dir.display()
    );
    Ok(data)
}

/// Write `map.json` into `dir`, creating the directory if needed.
pub fn write_map<P: TagPose>(
    dir: impl AsRef<Path>,
    map: &TagMap<P>,
) -> Result<PathBuf, DataError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = dir.join(MAP_FILE);
    write_json(&path, map)?;
    Ok(path)
}

/// Write `viewpoints.json` into `dir`, creating the directory if needed.
pub fn write_viewpoints(
    dir: impl AsRef<Path>,
    viewpoints: &ViewpointPoses,
) -> Result<PathBuf, DataError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = dir.join(VIEWPOINTS_FILE);
    write_json(&path, viewpoints)?;
    Ok(path)
}

#[derive(Deserialize)]
struct MapHeader {
    map_type: MapKind,
}

/// Variant stored in a `map.json` file.
pub fn read_map_kind(path: impl AsRef<Path>) -> Result<MapKind, DataError> {
    let header: MapHeader = load_json(path)?;
    Ok(header.map_type)
}

/// Load a `map.json` file written for pose variant `P`.
pub fn load_map<P: TagPose>(path: impl AsRef<Path>) -> Result<TagMap<P>, DataError> {
    let raw = fs::read_to_string(path)?;
    let header: MapHeader = serde_json::from_str(&raw)?;
    if header.map_type != P::KIND {
        return Err(DataError::MapType {
            expected: P::KIND,
            found: header.map_type,
        });
    }
    Ok(serde_json::from_str(&raw)?)
}

/// Load `viewpoints.json`.
pub fn load_viewpoint_poses(path: impl AsRef<Path>) -> Result<ViewpointPoses, DataError> {
    load_json(path)
}
