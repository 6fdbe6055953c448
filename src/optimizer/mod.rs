//! Pose optimization used by the semantic workers.
//!
//! The workers only see the [`PoseOptimizer`] trait, so the SLAM back-end can
//! plug in its own solver. [`WeightedPoseOptimizer`] is the built-in
//! implementation: pose-only Levenberg-Marquardt with moving-probability
//! weights.

pub mod pose_optim;

use anyhow::Result;

use crate::atlas::map::KeyFrameId;
use crate::system::SharedState;

pub use pose_optim::{PoseOptimConfig, WeightedPoseOptimizer};

/// Outcome of a pose optimization call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseOptimizationReport {
    /// KeyFrames whose pose was written back.
    pub keyframes_optimized: usize,
    /// Observations that entered the solve.
    pub num_observations: usize,
    /// Observations dropped because their point is classified dynamic.
    pub num_rejected_dynamic: usize,
    /// Observations failing the final χ² test.
    pub num_outliers: usize,
    /// LM residual evaluations.
    pub iterations: usize,
    /// Mean reprojection error before / after (pixels).
    pub initial_error: f64,
    pub final_error: f64,
}

impl PoseOptimizationReport {
    /// Accumulate another report (errors keep the worst value).
    pub fn merge(&mut self, other: &PoseOptimizationReport) {
        self.keyframes_optimized += other.keyframes_optimized;
        self.num_observations += other.num_observations;
        self.num_rejected_dynamic += other.num_rejected_dynamic;
        self.num_outliers += other.num_outliers;
        self.iterations += other.iterations;
        self.initial_error = self.initial_error.max(other.initial_error);
        self.final_error = self.final_error.max(other.final_error);
    }
}

/// Pose refinement collaborator of the semantic pipeline.
///
/// Implementations only touch keyframe poses, never map point positions.
pub trait PoseOptimizer: Send + Sync {
    /// Refine the pose of `kf`, using moving probabilities as weights and
    /// rejection criteria when `weight_by_moving_probability` is set.
    fn optimize_pose(
        &self,
        store: &SharedState,
        kf: KeyFrameId,
        weight_by_moving_probability: bool,
    ) -> Result<PoseOptimizationReport>;

    /// Semantic refinement over `kf` and its recent neighborhood.
    fn optimize_with_semantics(
        &self,
        store: &SharedState,
        kf: KeyFrameId,
    ) -> Result<PoseOptimizationReport>;

    /// Moving-probability threshold above which the optimizer drops a point,
    /// when it classifies points itself.
    fn dynamic_threshold(&self) -> Option<f32> {
        None
    }
}
