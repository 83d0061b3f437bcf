use crate::graph::{NodeRef, ViewpointId};
use tagmap_core::{CameraId, PnpError, TagId};

/// Errors raised while growing or refining a tag map.
///
/// The initialization variants (`DisconnectedNode`, `InsufficientCorrespondence`,
/// `DegenerateGeometry`) are local to one node: the node stays pending and the
/// rest of the graph keeps optimizing.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MapError {
    #[error("{node} has no observation linking it to an estimated node")]
    DisconnectedNode { node: NodeRef },
    #[error("{node}: need at least {required} point correspondences, got {found}")]
    InsufficientCorrespondence {
        node: NodeRef,
        found: usize,
        required: usize,
    },
    #[error("{node}: degenerate geometry ({source})")]
    DegenerateGeometry { node: NodeRef, source: PnpError },
    #[error("viewpoint `{viewpoint}` references unknown camera {camera}")]
    UnknownCamera {
        viewpoint: ViewpointId,
        camera: CameraId,
    },
    #[error("viewpoint `{0}` was already added")]
    DuplicateViewpoint(ViewpointId),
    #[error("viewpoint `{0}` is not part of the graph")]
    UnknownViewpoint(ViewpointId),
    #[error("viewpoint `{viewpoint}` observes tag {tag} more than once")]
    DuplicateObservation { viewpoint: ViewpointId, tag: TagId },
    #[error("no viewpoint observes any tag; the map has no anchor")]
    NoAnchor,
}

impl MapError {
    /// Attach a node to a perspective-solver failure.
    pub fn from_pnp(node: NodeRef, err: PnpError) -> Self {
        match err {
            PnpError::InsufficientCorrespondences { found, required } => {
                MapError::InsufficientCorrespondence {
                    node,
                    found,
                    required,
                }
            }
            source => MapError::DegenerateGeometry { node, source },
        }
    }

    /// Whether the error only defers one node instead of invalidating the input.
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            MapError::DisconnectedNode { .. }
                | MapError::InsufficientCorrespondence { .. }
                | MapError::DegenerateGeometry { .. }
        )
    }
}
