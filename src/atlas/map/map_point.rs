//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Besides its geometry a MapPoint carries a moving probability: the belief
//! that it lies on a dynamic object. The semantic pipeline only ever writes
//! that field; position and observations belong to the mapping side.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};

/// Neutral prior for the moving probability of a new point.
pub const MOVING_PROBABILITY_PRIOR: f32 = 0.5;

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Debug, Clone)]
pub struct MapPoint {
    /// Unique identifier for this MapPoint.
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// KeyFrames observing this point, mapped to feature index in that KeyFrame.
    pub observations: HashMap<KeyFrameId, usize>,

    /// KeyFrame that first created this MapPoint.
    pub first_kf_id: KeyFrameId,

    /// Probability in [0, 1] that the point belongs to a moving object.
    moving_probability: f32,

    /// Whether this point is marked as bad (should be removed).
    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, first_kf_id: KeyFrameId) -> Self {
        Self {
            id,
            position,
            observations: HashMap::new(),
            first_kf_id,
            moving_probability: MOVING_PROBABILITY_PRIOR,
            is_bad: false,
        }
    }

    /// Add an observation from a KeyFrame.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Remove an observation.
    ///
    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    /// Get the number of KeyFrames observing this point.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn moving_probability(&self) -> f32 {
        self.moving_probability
    }

    /// Overwrite the moving probability, clamped to [0, 1].
    pub fn set_moving_probability(&mut self, p: f32) {
        self.moving_probability = if p.is_nan() {
            MOVING_PROBABILITY_PRIOR
        } else {
            p.clamp(0.0, 1.0)
        };
    }
}
