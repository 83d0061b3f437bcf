//! Bipartite observation graph of tags and viewpoints.
//!
//! Observations are the only edge type. Nodes are created on first mention
//! and never removed; a node without a pose is *pending* and is invisible to
//! refinement until the initializer assigns one.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tagmap_core::{quad_area, CameraId, CameraIntrinsics, Se3, TagId, TagPose};

use crate::error::MapError;
use crate::map::TagSizes;

pub type ViewpointId = String;

/// A node of either side of the graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Tag(TagId),
    Viewpoint(ViewpointId),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Tag(id) => write!(f, "tag {id}"),
            NodeRef::Viewpoint(id) => write!(f, "viewpoint `{id}`"),
        }
    }
}

/// Pixel corners of one tag in one capture, in detector winding order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagObservation {
    pub tag_id: TagId,
    pub corners: [Point2<f64>; 4],
}

/// Everything one capture reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewpointObservations {
    pub id: ViewpointId,
    pub camera: CameraId,
    pub tags: Vec<TagObservation>,
}

impl ViewpointObservations {
    pub fn new(id: impl Into<ViewpointId>, camera: CameraId) -> Self {
        Self {
            id: id.into(),
            camera,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag_id: TagId, corners: [Point2<f64>; 4]) -> Self {
        self.tags.push(TagObservation { tag_id, corners });
        self
    }
}

/// One edge: a tag seen from a viewpoint.
#[derive(Clone, Debug)]
pub struct Observation {
    /// Index into [`ObservationGraph::viewpoints`].
    pub viewpoint: usize,
    pub tag: TagId,
    pub corners: [Point2<f64>; 4],
}

impl Observation {
    /// Image area covered by the tag, in px^2.
    pub fn footprint(&self) -> f64 {
        quad_area(&self.corners)
    }
}

#[derive(Clone, Debug)]
pub struct TagNode<P> {
    id: TagId,
    side_length: f64,
    pose: Option<P>,
    edges: Vec<usize>,
}

impl<P> TagNode<P> {
    #[inline]
    pub fn id(&self) -> TagId {
        self.id
    }

    #[inline]
    pub fn side_length(&self) -> f64 {
        self.side_length
    }

    /// `world_from_tag`, once estimated.
    pub fn pose(&self) -> Option<&P> {
        self.pose.as_ref()
    }

    /// Indices into [`ObservationGraph::observations`].
    pub fn edges(&self) -> &[usize] {
        &self.edges
    }
}

#[derive(Clone, Debug)]
pub struct ViewpointNode {
    id: ViewpointId,
    camera_id: CameraId,
    camera: CameraIntrinsics,
    pose: Option<Se3>,
    edges: Vec<usize>,
}

impl ViewpointNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn camera(&self) -> &CameraIntrinsics {
        &self.camera
    }

    /// `world_from_viewpoint`, once estimated.
    pub fn pose(&self) -> Option<&Se3> {
        self.pose.as_ref()
    }

    pub fn edges(&self) -> &[usize] {
        &self.edges
    }
}

#[derive(Clone, Debug)]
pub struct ObservationGraph<P> {
    sizes: TagSizes,
    tags: BTreeMap<TagId, TagNode<P>>,
    viewpoints: Vec<ViewpointNode>,
    viewpoint_index: HashMap<ViewpointId, usize>,
    observations: Vec<Observation>,
    anchor: Option<TagId>,
}

impl<P: TagPose> ObservationGraph<P> {
    pub fn new(sizes: TagSizes) -> Self {
        Self {
            sizes,
            tags: BTreeMap::new(),
            viewpoints: Vec::new(),
            viewpoint_index: HashMap::new(),
            observations: Vec::new(),
            anchor: None,
        }
    }

    pub fn tag_sizes(&self) -> &TagSizes {
        &self.sizes
    }

    /// Register a capture without observations. Returns its index.
    pub fn add_viewpoint(
        &mut self,
        id: impl Into<ViewpointId>,
        camera_id: CameraId,
        camera: CameraIntrinsics,
    ) -> Result<usize, MapError> {
        let id = id.into();
        if self.viewpoint_index.contains_key(&id) {
            return Err(MapError::DuplicateViewpoint(id));
        }
        let index = self.viewpoints.len();
        self.viewpoint_index.insert(id.clone(), index);
        self.viewpoints.push(ViewpointNode {
            id,
            camera_id,
            camera,
            pose: None,
            edges: Vec::new(),
        });
        Ok(index)
    }

    /// Link a viewpoint to a tag, creating the tag node on first mention.
    /// Returns the observation index.
    pub fn add_observation(
        &mut self,
        viewpoint: &str,
        tag: TagId,
        corners: [Point2<f64>; 4],
    ) -> Result<usize, MapError> {
        let vi = self
            .viewpoint_index(viewpoint)
            .ok_or_else(|| MapError::UnknownViewpoint(viewpoint.to_string()))?;
        let already = self.viewpoints[vi]
            .edges
            .iter()
            .any(|&e| self.observations[e].tag == tag);
        if already {
            return Err(MapError::DuplicateObservation {
                viewpoint: viewpoint.to_string(),
                tag,
            });
        }

        let index = self.observations.len();
        self.observations.push(Observation {
            viewpoint: vi,
            tag,
            corners,
        });
        self.viewpoints[vi].edges.push(index);

        let side_length = self.sizes.side_length(tag);
        self.tags
            .entry(tag)
            .or_insert_with(|| TagNode {
                id: tag,
                side_length,
                pose: None,
                edges: Vec::new(),
            })
            .edges
            .push(index);
        Ok(index)
    }

    pub fn is_estimated(&self, node: &NodeRef) -> bool {
        match node {
            NodeRef::Tag(id) => self.tags.get(id).is_some_and(|t| t.pose.is_some()),
            NodeRef::Viewpoint(id) => self
                .viewpoint_by_id(id)
                .is_some_and(|v| v.pose.is_some()),
        }
    }

    /// Nodes on the other side of the bipartition sharing an observation with `node`.
    pub fn neighbors(&self, node: &NodeRef) -> Vec<NodeRef> {
        match node {
            NodeRef::Tag(id) => self
                .tags
                .get(id)
                .map(|t| {
                    t.edges
                        .iter()
                        .map(|&e| {
                            let vi = self.observations[e].viewpoint;
                            NodeRef::Viewpoint(self.viewpoints[vi].id.clone())
                        })
                        .collect()
                })
                .unwrap_or_default(),
            NodeRef::Viewpoint(id) => self
                .viewpoint_by_id(id)
                .map(|v| {
                    v.edges
                        .iter()
                        .map(|&e| NodeRef::Tag(self.observations[e].tag))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn pending_tags(&self) -> Vec<TagId> {
        self.tags
            .values()
            .filter(|t| t.pose.is_none())
            .map(|t| t.id)
            .collect()
    }

    pub fn pending_viewpoints(&self) -> Vec<ViewpointId> {
        self.viewpoints
            .iter()
            .filter(|v| v.pose.is_none())
            .map(|v| v.id.clone())
            .collect()
    }

    pub(crate) fn pending_viewpoint_indices(&self) -> Vec<usize> {
        (0..self.viewpoints.len())
            .filter(|&i| self.viewpoints[i].pose.is_none())
            .collect()
    }

    /// The tag pinned at the identity pose.
    pub fn anchor(&self) -> Option<TagId> {
        self.anchor
    }

    pub fn tag(&self, id: TagId) -> Option<&TagNode<P>> {
        self.tags.get(&id)
    }

    /// Tags in ascending id order.
    pub fn tags(&self) -> impl Iterator<Item = &TagNode<P>> {
        self.tags.values()
    }

    pub fn viewpoint(&self, index: usize) -> Option<&ViewpointNode> {
        self.viewpoints.get(index)
    }

    pub fn viewpoint_index(&self, id: &str) -> Option<usize> {
        self.viewpoint_index.get(id).copied()
    }

    pub fn viewpoint_by_id(&self, id: &str) -> Option<&ViewpointNode> {
        self.viewpoint_index(id).map(|i| &self.viewpoints[i])
    }

    /// Viewpoints in insertion order.
    pub fn viewpoints(&self) -> &[ViewpointNode] {
        &self.viewpoints
    }

    /// Observations in insertion order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Poses of both endpoints, if both are estimated.
    pub fn endpoint_poses(&self, obs: &Observation) -> Option<(&ViewpointNode, &TagNode<P>, Se3, P)> {
        let viewpoint = self.viewpoints.get(obs.viewpoint)?;
        let tag = self.tags.get(&obs.tag)?;
        Some((viewpoint, tag, viewpoint.pose?, tag.pose?))
    }

    /// Pin `tag` at the identity pose. No-op once an anchor exists.
    pub(crate) fn pin_anchor(&mut self, tag: TagId) -> bool {
        if self.anchor.is_some() {
            return false;
        }
        match self.tags.get_mut(&tag) {
            Some(node) => {
                node.pose = Some(P::identity());
                self.anchor = Some(tag);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_tag_pose(&mut self, tag: TagId, pose: P) {
        if self.anchor == Some(tag) {
            return;
        }
        if let Some(node) = self.tags.get_mut(&tag) {
            node.pose = Some(pose);
        }
    }

    pub(crate) fn set_viewpoint_pose(&mut self, index: usize, pose: Se3) {
        if let Some(node) = self.viewpoints.get_mut(index) {
            node.pose = Some(pose);
        }
    }
}
