//! Stock convergence policy: grow the map one viewpoint at a time.

use serde::{Deserialize, Serialize};
use tagmap_core::TagPose;

use crate::builder::MapBuilder;
use crate::error::MapError;
use crate::graph::{NodeRef, ViewpointObservations};
use crate::map::{TagMap, ViewpointPoses};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Thresholds of the incremental driver loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergencePolicy {
    /// Rounds of (tag -> viewpoint, viewpoint -> tag) passes per iteration.
    pub passes_per_step: usize,
    /// Relative error change below which the next viewpoint is added.
    pub add_threshold: f64,
    /// Relative error change below which a complete map is converged.
    pub converge_threshold: f64,
    /// Total error (px^2) at or below which two consecutive iterations count
    /// as an exact fit: the relative change is taken as zero and the step as
    /// an improvement.
    pub error_floor: f64,
    /// Iteration cap; hitting it ends the run unconverged.
    pub max_iterations: usize,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            passes_per_step: 20,
            add_threshold: 1e-3,
            converge_threshold: 1e-6,
            error_floor: 1e-10,
            max_iterations: 10_000,
        }
    }
}

impl ConvergencePolicy {
    /// `(error - prev) / prev`, zero when both are zero.
    pub fn relative_change(prev: f64, error: f64) -> f64 {
        if prev == 0.0 && error == 0.0 {
            0.0
        } else {
            (error - prev) / prev
        }
    }
}

/// Outcome of [`build_map`].
#[derive(Clone, Debug)]
pub struct DriverReport<P> {
    pub map: TagMap<P>,
    pub viewpoints: ViewpointPoses,
    pub final_error: f64,
    pub iterations: usize,
    /// `false` when the iteration cap ended the run.
    pub converged: bool,
    /// Total error after every iteration.
    pub error_history: Vec<f64>,
    /// Nodes that never got a pose, with their last initialization error.
    pub deferred: Vec<(NodeRef, MapError)>,
}

/// Run the incremental driver over `viewpoints` in the given order.
///
/// Fails only on input errors or when no viewpoint observes any tag.
/// Viewpoints that cannot be initialized are reported in
/// [`DriverReport::deferred`] and do not stop the run.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(viewpoints = viewpoints.len()))
)]
pub fn build_map<P: TagPose>(
    builder: &mut MapBuilder<P>,
    viewpoints: &[ViewpointObservations],
    policy: &ConvergencePolicy,
) -> Result<DriverReport<P>, MapError> {
    if viewpoints.iter().all(|v| v.tags.is_empty()) {
        return Err(MapError::NoAnchor);
    }

    let mut next = 0usize;
    let mut need_add = true;
    let mut prev = f64::INFINITY;
    let mut converged = false;
    let mut iterations = 0usize;
    let mut history = Vec::new();

    while iterations < policy.max_iterations {
        iterations += 1;

        if need_add {
            let viewpoint = &viewpoints[next];
            next += 1;
            need_add = false;
            match builder.add_viewpoint(viewpoint) {
                Ok(()) => log::info!(
                    "added viewpoint `{}` ({next}/{})",
                    viewpoint.id,
                    viewpoints.len()
                ),
                Err(err) if err.is_node_local() => {
                    log::warn!("viewpoint `{}` deferred: {err}", viewpoint.id)
                }
                Err(err) => return Err(err),
            }
            builder.relinearize();
        }

        for _ in 0..policy.passes_per_step {
            builder.send_tag_to_viewpoint();
            builder.send_viewpoint_to_tag();
        }
        let mut improved = builder.update();
        let error = builder.total_detection_error();
        history.push(error);

        if prev.is_finite() {
            let change = if prev <= policy.error_floor && error <= policy.error_floor {
                improved = true;
                0.0
            } else {
                ConvergencePolicy::relative_change(prev, error)
            };
            log::info!(
                "iteration {iterations}: viewpoints {next}, error {error:.6e}, change {:.4}%",
                change * 100.0
            );

            if change.abs() < policy.add_threshold && improved {
                if next < viewpoints.len() {
                    need_add = true;
                } else if change.abs() < policy.converge_threshold {
                    converged = true;
                    break;
                }
            }
        }
        prev = error;
    }

    if converged {
        builder.mark_converged();
    } else {
        log::warn!(
            "stopped after {iterations} iterations without converging ({next}/{} viewpoints added)",
            viewpoints.len()
        );
    }

    Ok(DriverReport {
        map: builder.to_map(),
        viewpoints: builder.viewpoint_poses(),
        final_error: builder.total_detection_error(),
        iterations,
        converged,
        error_history: history,
        deferred: builder.deferred().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_change_handles_zero() {
        assert_eq!(ConvergencePolicy::relative_change(0.0, 0.0), 0.0);
        assert_eq!(ConvergencePolicy::relative_change(2.0, 1.0), -0.5);
        assert!(ConvergencePolicy::relative_change(0.0, 1.0).is_infinite());
    }

    #[test]
    fn default_policy_thresholds() {
        let p = ConvergencePolicy::default();
        assert_eq!(p.passes_per_step, 20);
        assert_eq!(p.add_threshold, 1e-3);
        assert_eq!(p.converge_threshold, 1e-6);
    }
}
