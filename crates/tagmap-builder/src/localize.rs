//! Camera pose against a finished map.

use serde::{Deserialize, Serialize};
use tagmap_core::{
    solve_tag_pnp, CameraIntrinsics, PnpParams, PoseAlgebra, Se3, TagId, TagPose, TagView,
};

use crate::error::MapError;
use crate::graph::{NodeRef, ViewpointObservations};
use crate::map::TagMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Localization {
    pub world_from_viewpoint: Se3,
    /// Root-mean-square corner error of the solve, in pixels.
    pub rms_px: f64,
    /// Map tags that contributed correspondences.
    pub tags_used: Vec<TagId>,
}

/// Recover `world_from_viewpoint` for a capture of mapped tags.
///
/// Tags absent from the map are ignored. The map is not modified.
pub fn localize_viewpoint<P: TagPose>(
    map: &TagMap<P>,
    viewpoint: &ViewpointObservations,
    camera: &CameraIntrinsics,
    params: &PnpParams,
) -> Result<Localization, MapError> {
    let node = NodeRef::Viewpoint(viewpoint.id.clone());
    let mut views = Vec::new();
    let mut tags_used = Vec::new();
    for obs in &viewpoint.tags {
        let Some(pose) = map.tag_pose(obs.tag_id) else {
            continue;
        };
        views.push(TagView {
            world_from_tag: pose.to_isometry(),
            side_length: map.tag_side_lengths.side_length(obs.tag_id),
            corners: obs.corners,
        });
        tags_used.push(obs.tag_id);
    }
    if views.is_empty() {
        return Err(MapError::DisconnectedNode { node });
    }

    let solution =
        solve_tag_pnp(camera, &views, params).map_err(|e| MapError::from_pnp(node, e))?;
    log::debug!(
        "localized `{}` from {} tags, rms {:.3} px",
        viewpoint.id,
        tags_used.len(),
        solution.rms_px
    );
    Ok(Localization {
        world_from_viewpoint: Se3(solution.camera_from_world.inverse()),
        rms_px: solution.rms_px,
        tags_used,
    })
}
