//! Alternating block refinement of tag and viewpoint poses.
//!
//! Each active observation contributes an 8-vector of corner residuals
//! (predicted minus observed pixels) linearized around the committed poses.
//! Message passes run block Gauss-Seidel on the damped normal equations:
//! one side of the bipartite graph is solved at a time against a frozen
//! snapshot of the other side's staged deltas. [`RefinementEngine::update`]
//! commits the staged deltas only if the total error does not grow.

use nalgebra::{DMatrix, DVector, Point2};
use std::collections::BTreeMap;
use tagmap_core::{
    central_difference, tag_corners, CameraIntrinsics, PoseAlgebra, Se3, TagId, TagPose,
};

use crate::graph::ObservationGraph;
use crate::params::{DampingParams, MapBuilderParams};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Residuals per observation: four corners, two coordinates each.
pub const RESIDUALS_PER_OBSERVATION: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// The graph changed since the last linearization.
    Uninitialized,
    Linearized,
    /// Set by a driver once its convergence policy is satisfied.
    Converged,
}

/// Pixel positions of a tag's corners seen from a viewpoint.
///
/// `None` if any corner lies behind the camera.
pub fn predict_corners<P: TagPose>(
    camera: &CameraIntrinsics,
    world_from_viewpoint: &Se3,
    world_from_tag: &P,
    side_length: f64,
) -> Option<[Point2<f64>; 4]> {
    let viewpoint_from_world = world_from_viewpoint.inverse();
    let mut out = [Point2::origin(); 4];
    for (px, corner) in out.iter_mut().zip(tag_corners(side_length).iter()) {
        let world = world_from_tag.transform_point(corner);
        *px = camera.project(&viewpoint_from_world.transform_point(&world))?;
    }
    Some(out)
}

/// Predicted minus observed corner pixels, stacked `[u0, v0, u1, v1, ...]`.
pub fn observation_residual<P: TagPose>(
    camera: &CameraIntrinsics,
    world_from_viewpoint: &Se3,
    world_from_tag: &P,
    side_length: f64,
    observed: &[Point2<f64>; 4],
) -> Option<DVector<f64>> {
    let predicted = predict_corners(camera, world_from_viewpoint, world_from_tag, side_length)?;
    let mut r = DVector::zeros(RESIDUALS_PER_OBSERVATION);
    for (i, (p, o)) in predicted.iter().zip(observed.iter()).enumerate() {
        r[2 * i] = p.x - o.x;
        r[2 * i + 1] = p.y - o.y;
    }
    Some(r)
}

/// Sum of squared corner distances over observations with both endpoints
/// estimated, accumulated in insertion order. `+inf` if any corner falls
/// behind its camera.
pub fn total_detection_error<P: TagPose>(graph: &ObservationGraph<P>) -> f64 {
    let mut total = 0.0;
    for obs in graph.observations() {
        let Some((viewpoint, tag, vp_pose, tag_pose)) = graph.endpoint_poses(obs) else {
            continue;
        };
        match observation_residual(
            viewpoint.camera(),
            &vp_pose,
            &tag_pose,
            tag.side_length(),
            &obs.corners,
        ) {
            Some(r) => total += r.norm_squared(),
            None => return f64::INFINITY,
        }
    }
    total
}

#[derive(Clone, Debug)]
struct LinearizedObservation {
    viewpoint: usize,
    tag: TagId,
    residual: DVector<f64>,
    /// 8 x 6, with respect to the right perturbation of `world_from_viewpoint`.
    j_viewpoint: DMatrix<f64>,
    /// 8 x DOF of the tag representation.
    j_tag: DMatrix<f64>,
}

/// Step engine over an [`ObservationGraph`].
///
/// The engine owns no poses: it reads and writes them through the graph it is
/// handed, so the graph stays the single source of truth between steps.
#[derive(Clone, Debug)]
pub struct RefinementEngine {
    state: EngineState,
    damping: DampingParams,
    lambda: f64,
    weight: f64,
    jacobian_step: f64,
    linearized: Vec<LinearizedObservation>,
    viewpoint_deltas: Vec<Option<DVector<f64>>>,
    tag_deltas: BTreeMap<TagId, DVector<f64>>,
    committed_error: f64,
}

impl RefinementEngine {
    pub fn new(params: &MapBuilderParams) -> Self {
        let sigma = params.pixel_sigma.max(f64::MIN_POSITIVE);
        Self {
            state: EngineState::Uninitialized,
            damping: params.damping.clone(),
            lambda: params.damping.initial,
            weight: 1.0 / (sigma * sigma),
            jacobian_step: params.jacobian_step,
            linearized: Vec::new(),
            viewpoint_deltas: Vec::new(),
            tag_deltas: BTreeMap::new(),
            committed_error: f64::INFINITY,
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Current damping factor.
    #[inline]
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Observations in the current linearization.
    #[inline]
    pub fn linearized_observations(&self) -> usize {
        self.linearized.len()
    }

    /// Mark the linearization stale after the graph changed.
    pub fn invalidate(&mut self) {
        self.state = EngineState::Uninitialized;
        self.lambda = self.damping.initial;
        self.linearized.clear();
        self.viewpoint_deltas.clear();
        self.tag_deltas.clear();
    }

    pub fn mark_converged(&mut self) {
        if self.state == EngineState::Linearized {
            self.state = EngineState::Converged;
        }
    }

    /// Relinearize every active observation and zero the staged deltas.
    ///
    /// Observations whose prediction falls behind the camera are left out of
    /// this linearization.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(observations = graph.observations().len()))
    )]
    pub fn relinearize<P: TagPose>(&mut self, graph: &ObservationGraph<P>) {
        let step = self.jacobian_step;
        self.linearized.clear();
        let mut skipped = 0usize;

        for obs in graph.observations() {
            let Some((viewpoint, tag, vp_pose, tag_pose)) = graph.endpoint_poses(obs) else {
                continue;
            };
            let camera = viewpoint.camera();
            let side = tag.side_length();
            let linearized = observation_residual(camera, &vp_pose, &tag_pose, side, &obs.corners)
                .and_then(|residual| {
                    let j_viewpoint = central_difference(Se3::DOF, step, |d| {
                        let vp = vp_pose.perturb(d);
                        observation_residual(camera, &vp, &tag_pose, side, &obs.corners)
                    })?;
                    let j_tag = central_difference(P::DOF, step, |d| {
                        let tag = tag_pose.perturb(d);
                        observation_residual(camera, &vp_pose, &tag, side, &obs.corners)
                    })?;
                    Some(LinearizedObservation {
                        viewpoint: obs.viewpoint,
                        tag: obs.tag,
                        residual,
                        j_viewpoint,
                        j_tag,
                    })
                });
            match linearized {
                Some(l) => self.linearized.push(l),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            log::debug!("relinearize: skipped {skipped} observations behind the camera");
        }

        self.viewpoint_deltas = graph
            .viewpoints()
            .iter()
            .map(|v| v.pose().map(|_| DVector::zeros(Se3::DOF)))
            .collect();
        self.tag_deltas = graph
            .tags()
            .filter(|t| t.pose().is_some() && Some(t.id()) != graph.anchor())
            .map(|t| (t.id(), DVector::zeros(P::DOF)))
            .collect();
        self.committed_error = total_detection_error(graph);
        self.state = EngineState::Linearized;
    }

    fn ensure_linearized<P: TagPose>(&mut self, graph: &ObservationGraph<P>) {
        if self.state == EngineState::Uninitialized {
            self.relinearize(graph);
        }
    }

    /// Damped block solve `(H + lambda diag(H) + eps I) x = -g`.
    fn solve_block(&self, mut h: DMatrix<f64>, g: &DVector<f64>) -> Option<DVector<f64>> {
        for k in 0..h.nrows() {
            h[(k, k)] += self.lambda * h[(k, k)] + self.damping.epsilon;
        }
        let delta = h.cholesky()?.solve(&(-g));
        let finite = delta.iter().all(|v| v.is_finite());
        finite.then_some(delta)
    }

    /// Stage new viewpoint deltas from the tags' staged deltas.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn send_tag_to_viewpoint<P: TagPose>(&mut self, graph: &ObservationGraph<P>) {
        self.ensure_linearized(graph);
        let n = self.viewpoint_deltas.len();
        let mut h = vec![DMatrix::<f64>::zeros(Se3::DOF, Se3::DOF); n];
        let mut g = vec![DVector::<f64>::zeros(Se3::DOF); n];
        let mut seen = vec![false; n];

        for l in &self.linearized {
            let mut r = l.residual.clone();
            if let Some(dt) = self.tag_deltas.get(&l.tag) {
                r += &l.j_tag * dt;
            }
            let jt = l.j_viewpoint.transpose();
            h[l.viewpoint] += &jt * &l.j_viewpoint * self.weight;
            g[l.viewpoint] += jt * r * self.weight;
            seen[l.viewpoint] = true;
        }

        let proposals: Vec<Option<DVector<f64>>> = (0..n)
            .map(|i| {
                self.viewpoint_deltas[i].as_ref()?;
                if !seen[i] {
                    return Some(DVector::zeros(Se3::DOF));
                }
                Some(
                    self.solve_block(h[i].clone(), &g[i])
                        .unwrap_or_else(|| DVector::zeros(Se3::DOF)),
                )
            })
            .collect();
        self.viewpoint_deltas = proposals;
    }

    /// Stage new tag deltas from the viewpoints' staged deltas. The anchor never moves.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn send_viewpoint_to_tag<P: TagPose>(&mut self, graph: &ObservationGraph<P>) {
        self.ensure_linearized(graph);
        let mut blocks: BTreeMap<TagId, (DMatrix<f64>, DVector<f64>)> = BTreeMap::new();

        for l in &self.linearized {
            if !self.tag_deltas.contains_key(&l.tag) {
                continue;
            }
            let mut r = l.residual.clone();
            if let Some(Some(dv)) = self.viewpoint_deltas.get(l.viewpoint) {
                r += &l.j_viewpoint * dv;
            }
            let jt = l.j_tag.transpose();
            let (h, g) = blocks
                .entry(l.tag)
                .or_insert_with(|| (DMatrix::zeros(P::DOF, P::DOF), DVector::zeros(P::DOF)));
            *h += &jt * &l.j_tag * self.weight;
            *g += jt * r * self.weight;
        }

        let proposals: BTreeMap<TagId, DVector<f64>> = self
            .tag_deltas
            .keys()
            .map(|&id| {
                let delta = blocks
                    .get(&id)
                    .and_then(|(h, g)| self.solve_block(h.clone(), g))
                    .unwrap_or_else(|| DVector::zeros(P::DOF));
                (id, delta)
            })
            .collect();
        self.tag_deltas = proposals;
    }

    /// Apply the staged deltas if the total error does not increase.
    ///
    /// Ties commit. On commit the graph is relinearized and the damping
    /// shrinks; on reject the previous poses are restored, the damping grows
    /// and the staged deltas are zeroed. Returns whether the step committed.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, ret))]
    pub fn update<P: TagPose>(&mut self, graph: &mut ObservationGraph<P>) -> bool {
        self.ensure_linearized(graph);
        let before = self.committed_error;

        let mut old_viewpoints = Vec::new();
        for (index, delta) in self.viewpoint_deltas.iter().enumerate() {
            let pose = graph.viewpoint(index).and_then(|v| v.pose().copied());
            let (Some(delta), Some(pose)) = (delta, pose) else {
                continue;
            };
            old_viewpoints.push((index, pose));
            graph.set_viewpoint_pose(index, pose.perturb(delta.as_slice()));
        }
        let mut old_tags = Vec::new();
        for (&id, delta) in &self.tag_deltas {
            let Some(pose) = graph.tag(id).and_then(|t| t.pose().copied()) else {
                continue;
            };
            old_tags.push((id, pose));
            graph.set_tag_pose(id, pose.perturb(delta.as_slice()));
        }

        let after = total_detection_error(graph);
        if after <= before {
            log::debug!("update committed: {before:.6e} -> {after:.6e}");
            self.relinearize(graph);
            self.lambda = (self.lambda * self.damping.shrink).max(self.damping.min);
            true
        } else {
            log::debug!("update rejected: {before:.6e} -> {after:.6e}");
            for (index, pose) in old_viewpoints {
                graph.set_viewpoint_pose(index, pose);
            }
            for (id, pose) in old_tags {
                graph.set_tag_pose(id, pose);
            }
            self.lambda = (self.lambda * self.damping.grow).min(self.damping.max);
            self.zero_deltas();
            false
        }
    }

    fn zero_deltas(&mut self) {
        for d in self.viewpoint_deltas.iter_mut().flatten() {
            d.fill(0.0);
        }
        for d in self.tag_deltas.values_mut() {
            d.fill(0.0);
        }
    }

    /// Largest staged delta component, for diagnostics.
    pub fn staged_step_norm(&self) -> f64 {
        self.viewpoint_deltas
            .iter()
            .flatten()
            .chain(self.tag_deltas.values())
            .map(|d| d.amax())
            .fold(0.0, f64::max)
    }
}
