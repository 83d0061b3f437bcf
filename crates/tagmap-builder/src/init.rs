//! First-pass poses for pending nodes.
//!
//! A pending viewpoint is placed by a perspective solve over every tag it
//! shares with the estimated graph. A pending tag is placed from the estimated
//! viewpoint that sees it largest. Both run to a fixpoint, so one successful
//! placement can unlock nodes that were deferred earlier.

use tagmap_core::{solve_tag_pnp, tag_pose_in_camera, PnpParams, Se3, TagId, TagPose, TagView};

use crate::error::MapError;
use crate::graph::{NodeRef, ObservationGraph};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// What one initialization sweep achieved.
#[derive(Clone, Debug, Default)]
pub struct InitOutcome {
    /// Nodes that received their first pose, in placement order.
    pub initialized: Vec<NodeRef>,
    /// Nodes still pending, with the reason from their last attempt.
    pub deferred: Vec<(NodeRef, MapError)>,
}

impl InitOutcome {
    pub fn error_for(&self, node: &NodeRef) -> Option<&MapError> {
        self.deferred
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, e)| e)
    }
}

/// `world_from_viewpoint` for a pending viewpoint.
pub fn initialize_viewpoint<P: TagPose>(
    graph: &ObservationGraph<P>,
    index: usize,
    params: &PnpParams,
) -> Result<Se3, MapError> {
    let viewpoint = graph
        .viewpoint(index)
        .ok_or_else(|| MapError::UnknownViewpoint(index.to_string()))?;
    let node = NodeRef::Viewpoint(viewpoint.id().to_string());

    let views: Vec<TagView> = viewpoint
        .edges()
        .iter()
        .filter_map(|&e| {
            let obs = &graph.observations()[e];
            let tag = graph.tag(obs.tag)?;
            let pose = tag.pose()?;
            Some(TagView {
                world_from_tag: pose.to_isometry(),
                side_length: tag.side_length(),
                corners: obs.corners,
            })
        })
        .collect();
    if views.is_empty() {
        return Err(MapError::DisconnectedNode { node });
    }

    let solution = solve_tag_pnp(viewpoint.camera(), &views, params)
        .map_err(|e| MapError::from_pnp(node, e))?;
    Ok(Se3(solution.camera_from_world.inverse()))
}

/// `world_from_tag` for a pending tag, projected onto the map variant.
pub fn initialize_tag<P: TagPose>(
    graph: &ObservationGraph<P>,
    tag_id: TagId,
    params: &PnpParams,
) -> Result<P, MapError> {
    let node = NodeRef::Tag(tag_id);
    let tag = graph
        .tag(tag_id)
        .ok_or(MapError::DisconnectedNode { node: node.clone() })?;

    let mut best = None;
    for &e in tag.edges() {
        let obs = &graph.observations()[e];
        let Some(viewpoint) = graph.viewpoint(obs.viewpoint) else {
            continue;
        };
        let Some(world_from_viewpoint) = viewpoint.pose() else {
            continue;
        };
        let area = obs.footprint();
        if best.as_ref().is_none_or(|(a, _, _, _)| area > *a) {
            best = Some((area, viewpoint, *world_from_viewpoint, obs));
        }
    }
    let Some((_, viewpoint, world_from_viewpoint, obs)) = best else {
        return Err(MapError::DisconnectedNode { node });
    };

    let solution = tag_pose_in_camera(viewpoint.camera(), tag.side_length(), &obs.corners, params)
        .map_err(|e| MapError::from_pnp(node, e))?;
    let world_from_tag = world_from_viewpoint.isometry() * solution.camera_from_world;
    Ok(P::from_isometry(&world_from_tag))
}

/// Initialize every pending node reachable from the estimated graph.
#[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
pub fn initialize_pending<P: TagPose>(
    graph: &mut ObservationGraph<P>,
    params: &PnpParams,
) -> InitOutcome {
    let mut outcome = InitOutcome::default();
    loop {
        let mut deferred = Vec::new();
        let mut progressed = false;

        for index in graph.pending_viewpoint_indices() {
            match initialize_viewpoint(graph, index, params) {
                Ok(pose) => {
                    graph.set_viewpoint_pose(index, pose);
                    if let Some(v) = graph.viewpoint(index) {
                        log::debug!("initialized viewpoint `{}`", v.id());
                        outcome
                            .initialized
                            .push(NodeRef::Viewpoint(v.id().to_string()));
                    }
                    progressed = true;
                }
                Err(err) => deferred.push(err),
            }
        }

        for tag_id in graph.pending_tags() {
            match initialize_tag(graph, tag_id, params) {
                Ok(pose) => {
                    graph.set_tag_pose(tag_id, pose);
                    log::debug!("initialized tag {tag_id}");
                    outcome.initialized.push(NodeRef::Tag(tag_id));
                    progressed = true;
                }
                Err(err) => deferred.push(err),
            }
        }

        if !progressed {
            outcome.deferred = deferred
                .into_iter()
                .filter_map(|err| deferred_node(&err).map(|n| (n, err)))
                .collect();
            return outcome;
        }
    }
}

fn deferred_node(err: &MapError) -> Option<NodeRef> {
    match err {
        MapError::DisconnectedNode { node }
        | MapError::InsufficientCorrespondence { node, .. }
        | MapError::DegenerateGeometry { node, .. } => Some(node.clone()),
        _ => None,
    }
}
