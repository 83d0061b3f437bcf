use serde::{Deserialize, Serialize};
use tagmap_core::PnpParams;

/// Levenberg-Marquardt style damping of the message-pass solves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DampingParams {
    /// Damping after construction and after every new viewpoint.
    pub initial: f64,
    /// Multiplier applied after a committed update.
    pub shrink: f64,
    /// Multiplier applied after a rejected update.
    pub grow: f64,
    pub min: f64,
    pub max: f64,
    /// Absolute diagonal regularization added to every block solve.
    pub epsilon: f64,
}

impl Default for DampingParams {
    fn default() -> Self {
        Self {
            initial: 1e-4,
            shrink: 0.1,
            grow: 10.0,
            min: 1e-9,
            max: 1e9,
            epsilon: 1e-9,
        }
    }
}

/// Configuration for [`crate::MapBuilder`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapBuilderParams {
    /// Corner detection noise in pixels; residuals are weighted by `1 / sigma^2`.
    pub pixel_sigma: f64,
    /// Central-difference step for edge Jacobians, in tangent units.
    pub jacobian_step: f64,
    pub damping: DampingParams,
    /// Perspective solver used to initialize new nodes.
    pub pnp: PnpParams,
}

impl Default for MapBuilderParams {
    fn default() -> Self {
        Self {
            pixel_sigma: 1.0,
            jacobian_step: 1e-6,
            damping: DampingParams::default(),
            pnp: PnpParams::default(),
        }
    }
}
