//! Incremental construction of fiducial tag maps.
//!
//! A map is grown from captures ("viewpoints") that each report the pixel
//! corners of the tags they see. The crate keeps a bipartite
//! [`ObservationGraph`] of tags and viewpoints, places new nodes with a
//! perspective solve against the already-estimated part of the graph, and
//! refines all poses by alternating block updates over the two sides of the
//! graph. The world frame is the pose of the first tag seen by the first
//! non-empty viewpoint.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use tagmap_builder::{build_map, ConvergencePolicy, MapBuilder, MapBuilderParams, TagSizes};
//! use tagmap_core::{CameraIntrinsics, Se2};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cameras = BTreeMap::new();
//! cameras.insert(0, CameraIntrinsics::pinhole(800.0, 800.0, 640.0, 360.0)?);
//! let mut builder: MapBuilder<Se2> =
//!     MapBuilder::new(cameras, TagSizes::uniform(0.2)?, MapBuilderParams::default());
//! let viewpoints = Vec::new();
//! let report = build_map(&mut builder, &viewpoints, &ConvergencePolicy::default())?;
//! println!("{} tags, error {:.3e}", report.map.len(), report.final_error);
//! # Ok(())
//! # }
//! ```

mod builder;
mod driver;
mod error;
mod graph;
mod init;
mod localize;
mod map;
mod params;
mod refine;

pub use builder::MapBuilder;
pub use driver::{build_map, ConvergencePolicy, DriverReport};
pub use error::MapError;
pub use graph::{
    NodeRef, Observation, ObservationGraph, TagNode, TagObservation, ViewpointId, ViewpointNode,
    ViewpointObservations,
};
pub use init::{initialize_pending, initialize_tag, initialize_viewpoint, InitOutcome};
pub use localize::{localize_viewpoint, Localization};
pub use map::{TagMap, TagSizeError, TagSizes, ViewpointPoses, DEFAULT_SIZE_KEY};
pub use params::{DampingParams, MapBuilderParams};
pub use refine::{
    observation_residual, predict_corners, total_detection_error, EngineState, RefinementEngine,
    RESIDUALS_PER_OBSERVATION,
};
