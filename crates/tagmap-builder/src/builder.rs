use std::collections::{BTreeMap, BTreeSet};
use tagmap_core::{CameraId, CameraIntrinsics, TagId, TagPose};

use crate::error::MapError;
use crate::graph::{NodeRef, ObservationGraph, ViewpointId, ViewpointObservations};
use crate::init::initialize_pending;
use crate::map::{TagMap, TagSizes, ViewpointPoses};
use crate::params::MapBuilderParams;
use crate::refine::{total_detection_error, EngineState, RefinementEngine};

/// Incremental map builder with an explicit step API.
///
/// `P` selects the tag representation ([`tagmap_core::Se2`],
/// [`tagmap_core::Se2Height`] or [`tagmap_core::Se3`]) once for the whole map.
/// Callers add viewpoints, run message passes and call [`MapBuilder::update`]
/// under a convergence policy of their choice; [`crate::build_map`] is the
/// stock one.
#[derive(Clone, Debug)]
pub struct MapBuilder<P> {
    params: MapBuilderParams,
    cameras: BTreeMap<CameraId, CameraIntrinsics>,
    graph: ObservationGraph<P>,
    engine: RefinementEngine,
    deferred: Vec<(NodeRef, MapError)>,
}

impl<P: TagPose> MapBuilder<P> {
    pub fn new(
        cameras: BTreeMap<CameraId, CameraIntrinsics>,
        sizes: TagSizes,
        params: MapBuilderParams,
    ) -> Self {
        let engine = RefinementEngine::new(&params);
        Self {
            params,
            cameras,
            graph: ObservationGraph::new(sizes),
            engine,
            deferred: Vec::new(),
        }
    }

    pub fn params(&self) -> &MapBuilderParams {
        &self.params
    }

    pub fn graph(&self) -> &ObservationGraph<P> {
        &self.graph
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Pending nodes and the reason each could not be initialized yet.
    pub fn deferred(&self) -> &[(NodeRef, MapError)] {
        &self.deferred
    }

    /// Insert a capture and initialize whatever it makes reachable.
    ///
    /// Input problems (unknown camera, duplicate ids) reject the viewpoint
    /// before the graph is touched. If the viewpoint itself cannot be
    /// initialized it is kept as a pending node, its initialization error is
    /// returned and every committed pose is left unchanged.
    pub fn add_viewpoint(&mut self, viewpoint: &ViewpointObservations) -> Result<(), MapError> {
        let camera = self
            .cameras
            .get(&viewpoint.camera)
            .cloned()
            .ok_or_else(|| MapError::UnknownCamera {
                viewpoint: viewpoint.id.clone(),
                camera: viewpoint.camera,
            })?;
        if self.graph.viewpoint_index(&viewpoint.id).is_some() {
            return Err(MapError::DuplicateViewpoint(viewpoint.id.clone()));
        }
        let mut seen = BTreeSet::new();
        for obs in &viewpoint.tags {
            if !seen.insert(obs.tag_id) {
                return Err(MapError::DuplicateObservation {
                    viewpoint: viewpoint.id.clone(),
                    tag: obs.tag_id,
                });
            }
        }

        self.graph
            .add_viewpoint(viewpoint.id.clone(), viewpoint.camera, camera)?;
        for obs in &viewpoint.tags {
            self.graph
                .add_observation(&viewpoint.id, obs.tag_id, obs.corners)?;
        }
        if self.graph.anchor().is_none() {
            if let Some(first) = viewpoint.tags.first() {
                self.graph.pin_anchor(first.tag_id);
                log::info!("world frame anchored at tag {}", first.tag_id);
            }
        }

        self.engine.invalidate();
        let outcome = initialize_pending(&mut self.graph, &self.params.pnp);
        for (node, err) in &outcome.deferred {
            log::debug!("{node} stays pending: {err}");
        }
        self.deferred = outcome.deferred;

        let node = NodeRef::Viewpoint(viewpoint.id.clone());
        if self.graph.is_estimated(&node) {
            log::debug!(
                "viewpoint `{}` initialized; {} nodes placed",
                viewpoint.id,
                outcome.initialized.len()
            );
            return Ok(());
        }
        let err = self
            .deferred
            .iter()
            .find(|(n, _)| *n == node)
            .map(|(_, e)| e.clone())
            .unwrap_or(MapError::DisconnectedNode { node });
        Err(err)
    }

    pub fn relinearize(&mut self) {
        self.engine.relinearize(&self.graph);
    }

    pub fn send_tag_to_viewpoint(&mut self) {
        self.engine.send_tag_to_viewpoint(&self.graph);
    }

    pub fn send_viewpoint_to_tag(&mut self) {
        self.engine.send_viewpoint_to_tag(&self.graph);
    }

    /// Commit the staged deltas unless the total error grows.
    pub fn update(&mut self) -> bool {
        self.engine.update(&mut self.graph)
    }

    pub fn mark_converged(&mut self) {
        self.engine.mark_converged();
    }

    pub fn total_detection_error(&self) -> f64 {
        total_detection_error(&self.graph)
    }

    /// Estimated `world_from_tag` poses.
    pub fn tag_poses(&self) -> BTreeMap<TagId, P> {
        self.graph
            .tags()
            .filter_map(|t| t.pose().map(|p| (t.id(), *p)))
            .collect()
    }

    /// Estimated `world_from_viewpoint` poses.
    pub fn viewpoint_poses(&self) -> ViewpointPoses {
        self.graph
            .viewpoints()
            .iter()
            .filter_map(|v| v.pose().map(|p| (v.id().to_string(), *p)))
            .collect()
    }

    pub fn pending_tags(&self) -> Vec<TagId> {
        self.graph.pending_tags()
    }

    pub fn pending_viewpoints(&self) -> Vec<ViewpointId> {
        self.graph.pending_viewpoints()
    }

    pub fn to_map(&self) -> TagMap<P> {
        TagMap::new(self.graph.tag_sizes().clone(), self.tag_poses())
    }
}
