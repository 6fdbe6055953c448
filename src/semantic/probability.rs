//! Per-map-point moving probability.
//!
//! Every time a keyframe gets its mask, each map point it observes receives
//! one binary observation: dynamic if the feature's pixel lies inside the
//! dilated mask, static otherwise. A [`MovingProbabilityPolicy`] folds that
//! observation into the point's probability; [`DynamicClassifier`] thresholds
//! the result.
//!
//! The dispatcher thread is the only writer of moving probabilities, which is
//! what keeps the read-modify-write below free of point-level locking.

use std::time::Instant;

use nalgebra::Point2;
use tracing::{debug, warn};

use crate::atlas::map::{KeyFrameId, MapPoint, MapPointId};
use crate::system::SharedState;

use super::config::{ProbabilityModel, ProbabilityUpdateConfig};
use super::stats::SemanticStats;

/// Probabilities never reach exactly 0 or 1, where Bayes updates get stuck.
const PROBABILITY_FLOOR: f32 = 1e-3;
const PROBABILITY_CEIL: f32 = 1.0 - 1e-3;

/// Update rule for one binary observation.
///
/// Implementations must be monotonic: a dynamic observation never lowers the
/// probability and a static one never raises it.
pub trait MovingProbabilityPolicy: Send + Sync {
    fn update(&self, prior: f32, observed_dynamic: bool) -> f32;
}

/// Binary Bayes filter with a symmetric detection likelihood.
///
/// `p' = l·p / (l·p + (1 − l)(1 − p))` with `l = dynamic_likelihood` for a
/// dynamic observation and `1 − l` for a static one.
#[derive(Debug, Clone, Copy)]
pub struct BayesianUpdate {
    pub dynamic_likelihood: f32,
}

impl MovingProbabilityPolicy for BayesianUpdate {
    fn update(&self, prior: f32, observed_dynamic: bool) -> f32 {
        let l = if observed_dynamic {
            self.dynamic_likelihood
        } else {
            1.0 - self.dynamic_likelihood
        };
        let num = l * prior;
        let den = num + (1.0 - l) * (1.0 - prior);
        if den <= f32::EPSILON {
            return prior;
        }
        (num / den).clamp(PROBABILITY_FLOOR, PROBABILITY_CEIL)
    }
}

/// Exponential moving average towards the observation (1 or 0).
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBlend {
    pub alpha: f32,
}

impl MovingProbabilityPolicy for ExponentialBlend {
    fn update(&self, prior: f32, observed_dynamic: bool) -> f32 {
        let z = if observed_dynamic { 1.0 } else { 0.0 };
        ((1.0 - self.alpha) * prior + self.alpha * z).clamp(PROBABILITY_FLOOR, PROBABILITY_CEIL)
    }
}

/// Build the policy selected in the configuration.
pub fn policy_from_config(config: &ProbabilityUpdateConfig) -> Box<dyn MovingProbabilityPolicy> {
    match config.model {
        ProbabilityModel::Bayesian => Box::new(BayesianUpdate {
            dynamic_likelihood: config.dynamic_likelihood,
        }),
        ProbabilityModel::Exponential => Box::new(ExponentialBlend {
            alpha: config.alpha,
        }),
    }
}

/// Threshold classifier over moving probabilities.
#[derive(Debug, Clone, Copy)]
pub struct DynamicClassifier {
    threshold: f32,
}

impl DynamicClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Unknown points count as dynamic. A probability equal to the threshold
    /// is static.
    pub fn is_dynamic(&self, point: Option<&MapPoint>) -> bool {
        match point {
            None => true,
            Some(mp) => self.is_dynamic_probability(mp.moving_probability()),
        }
    }

    pub fn is_dynamic_probability(&self, p: f32) -> bool {
        p > self.threshold
    }
}

/// Outcome of one keyframe's probability pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbabilityUpdateSummary {
    pub dynamic_observations: usize,
    pub static_observations: usize,
    /// Features skipped because their pixel is outside the mask interior.
    pub skipped: usize,
}

/// Fold the mask of `kf_id` into every map point it observes.
pub fn update_moving_probabilities(
    shared: &SharedState,
    kf_id: KeyFrameId,
    policy: &dyn MovingProbabilityPolicy,
    stats: &SemanticStats,
) -> ProbabilityUpdateSummary {
    let start = Instant::now();
    let mut summary = ProbabilityUpdateSummary::default();

    // Phase 1: collect observations under the read lock
    let observations: Vec<(MapPointId, bool, f32)> = {
        let atlas = shared.atlas.read();
        let Some(kf) = atlas.keyframe(kf_id) else {
            warn!("{} vanished before its probability update", kf_id);
            return summary;
        };
        if !kf.has_mask() {
            warn!("{} has no mask, probabilities left unchanged", kf_id);
            return summary;
        }

        let mut out = Vec::with_capacity(kf.num_map_points());
        for (idx, mp_id) in kf.observed_map_points() {
            let Some(mp) = atlas.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            let uv: Point2<f64> = match kf.keypoints.get(idx) {
                Some(uv) => *uv,
                None => continue,
            };
            match kf.mask_value_at(&uv) {
                Some(v) => out.push((mp_id, v != 0, mp.moving_probability())),
                None => summary.skipped += 1,
            }
        }
        out
    };

    // Phase 2: compute without holding the lock
    let updated: Vec<(MapPointId, f32)> = observations
        .iter()
        .map(|&(mp_id, dynamic, prior)| {
            if dynamic {
                summary.dynamic_observations += 1;
            } else {
                summary.static_observations += 1;
            }
            (mp_id, policy.update(prior, dynamic))
        })
        .collect();

    // Phase 3: write back
    {
        let mut atlas = shared.atlas.write();
        for (mp_id, p) in updated {
            if let Some(mp) = atlas.map_point_mut(mp_id) {
                mp.set_moving_probability(p);
            }
        }
    }

    stats.record_probability_update(start.elapsed());
    debug!(
        "{}: moving probability updated ({} dynamic, {} static, {} skipped)",
        kf_id, summary.dynamic_observations, summary.static_observations, summary.skipped
    );
    summary
}
