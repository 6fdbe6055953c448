//! Shared state between the SLAM front-end and the semantic workers.
//!
//! The `SharedState` struct holds the map graph every thread touches, protected
//! by a single reader-writer lock, plus the graph-store operations the
//! semantic pipeline relies on.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Point2, Vector3};
use parking_lot::RwLock;
use tracing::warn;

use crate::atlas::atlas::{Atlas, MapIndex};
use crate::atlas::map::{KeyFrame, KeyFrameId, MapPoint, MapPointId};
use crate::error::{SemanticError, SemanticResult};
use crate::geometry::SE3;

/// How many times `current_map` polls a bad map before giving up.
const MAP_POLL_ATTEMPTS: usize = 50;
const MAP_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Shared state accessible by the front-end and every semantic worker.
pub struct SharedState {
    /// The Atlas containing all maps, keyframes, and map points.
    /// Workers read under the lock and write their results back briefly.
    pub atlas: RwLock<Atlas>,
}

impl SharedState {
    /// Create a new SharedState with an empty Atlas.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Index of the current map, creating one on first use.
    ///
    /// While the current map is flagged bad (a reset is in progress) this
    /// polls for a bounded time and then reports [`SemanticError::MapUnavailable`].
    pub fn current_map(&self) -> SemanticResult<MapIndex> {
        for attempt in 0..MAP_POLL_ATTEMPTS {
            {
                let mut atlas = self.atlas.write();
                let idx = atlas.current_map_index();
                let bad = atlas.map(idx).map_or(true, |m| m.is_bad());
                if !bad {
                    return Ok(idx);
                }
            }
            if attempt + 1 < MAP_POLL_ATTEMPTS {
                std::thread::sleep(MAP_POLL_INTERVAL);
            }
        }
        warn!("Current map stayed bad for {} polls", MAP_POLL_ATTEMPTS);
        Err(SemanticError::MapUnavailable)
    }

    /// Create a keyframe in the current map and return its handle.
    pub fn create_keyframe(
        &self,
        timestamp_ns: u64,
        pose: SE3,
        image: Arc<image::RgbImage>,
        keypoints: Vec<Point2<f64>>,
    ) -> SemanticResult<KeyFrameId> {
        let idx = self.current_map()?;
        let mut atlas = self.atlas.write();
        let map = atlas.map_mut(idx).ok_or(SemanticError::MapUnavailable)?;
        Ok(map.create_keyframe(timestamp_ns, pose, image, keypoints))
    }

    /// Insert an already built keyframe into the current map.
    ///
    /// Fails with [`SemanticError::DuplicateKeyFrame`] if any map already
    /// holds that id; the existing keyframe is left as is.
    pub fn add_keyframe(&self, kf: KeyFrame) -> SemanticResult<KeyFrameId> {
        let idx = self.current_map()?;
        let id = kf.id;
        let mut atlas = self.atlas.write();
        if atlas.keyframe(id).is_some() {
            warn!("{} already in the graph, insert refused", id);
            return Err(SemanticError::DuplicateKeyFrame(id));
        }
        let map = atlas.map_mut(idx).ok_or(SemanticError::MapUnavailable)?;
        map.add_keyframe(kf);
        Ok(id)
    }

    /// Remove a keyframe from the graph. Handles held by queues become
    /// dangling and are skipped by their consumers.
    pub fn erase_keyframe(&self, kf_id: KeyFrameId) -> bool {
        self.atlas.write().erase_keyframe(kf_id).is_some()
    }

    /// Create a map point in the current map, first seen by `first_kf_id`.
    pub fn create_map_point(
        &self,
        position: Vector3<f64>,
        first_kf_id: KeyFrameId,
    ) -> SemanticResult<MapPointId> {
        let idx = self.current_map()?;
        let mut atlas = self.atlas.write();
        let map = atlas.map_mut(idx).ok_or(SemanticError::MapUnavailable)?;
        Ok(map.create_map_point(position, first_kf_id))
    }

    /// Record that feature `feature_idx` of `kf_id` observes `mp_id`.
    pub fn associate(&self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let mut atlas = self.atlas.write();
        atlas
            .all_maps()
            .iter()
            .position(|m| m.get_keyframe(kf_id).is_some())
            .and_then(|idx| atlas.map_mut(idx))
            .map_or(false, |map| map.associate(kf_id, feature_idx, mp_id))
    }

    /// Handles of every keyframe, ascending.
    pub fn all_keyframes(&self) -> Vec<KeyFrameId> {
        self.atlas.read().all_keyframe_ids()
    }

    /// Snapshot of every map point, ordered by handle.
    pub fn all_map_points(&self) -> Vec<MapPoint> {
        self.atlas.read().all_map_points()
    }

    /// Moving probability of a map point, if it exists.
    pub fn moving_probability(&self, mp_id: MapPointId) -> Option<f32> {
        self.atlas
            .read()
            .map_point(mp_id)
            .map(MapPoint::moving_probability)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            atlas: RwLock::new(Atlas::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    fn image() -> Arc<RgbImage> {
        Arc::new(RgbImage::new(8, 8))
    }

    #[test]
    fn test_current_map_created_on_demand() {
        let shared = SharedState::new();
        assert_eq!(shared.current_map().unwrap(), 0);
        assert_eq!(shared.atlas.read().num_maps(), 1);
    }

    #[test]
    fn test_current_map_unavailable_while_bad() {
        let shared = SharedState::new();
        let idx = shared.current_map().unwrap();
        shared.atlas.write().map_mut(idx).unwrap().set_bad(true);

        assert!(matches!(
            shared.current_map(),
            Err(SemanticError::MapUnavailable)
        ));
        assert!(shared
            .create_keyframe(0, SE3::identity(), image(), vec![])
            .is_err());
    }

    #[test]
    fn test_graph_store_operations() {
        let shared = SharedState::new();
        let kf0 = shared
            .create_keyframe(0, SE3::identity(), image(), vec![Point2::new(1.0, 1.0)])
            .unwrap();
        let kf1 = shared
            .create_keyframe(1, SE3::identity(), image(), vec![Point2::new(2.0, 2.0)])
            .unwrap();
        let mp = shared
            .create_map_point(Vector3::new(0.0, 0.0, 2.0), kf0)
            .unwrap();
        assert!(shared.associate(kf0, 0, mp));
        assert!(shared.associate(kf1, 0, mp));
        assert!(!shared.associate(kf1, 7, mp));

        assert_eq!(shared.all_keyframes(), vec![kf0, kf1]);
        let points = shared.all_map_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].num_observations(), 2);
        assert_eq!(shared.moving_probability(mp), Some(0.5));

        assert!(shared.erase_keyframe(kf0));
        assert!(!shared.erase_keyframe(kf0));
        assert_eq!(shared.all_keyframes(), vec![kf1]);
        assert_eq!(shared.all_map_points()[0].num_observations(), 1);
    }

    #[test]
    fn test_duplicate_keyframe_rejected() {
        let shared = SharedState::new();
        let kf = shared
            .create_keyframe(5, SE3::identity(), image(), vec![Point2::new(1.0, 1.0)])
            .unwrap();
        let mp = shared
            .create_map_point(Vector3::new(0.0, 0.0, 2.0), kf)
            .unwrap();
        assert!(shared.associate(kf, 0, mp));

        let copy = KeyFrame::new(kf, 42, SE3::identity(), image(), vec![Point2::new(3.0, 3.0)]);
        assert!(matches!(
            shared.add_keyframe(copy),
            Err(SemanticError::DuplicateKeyFrame(id)) if id == kf
        ));

        let atlas = shared.atlas.read();
        let stored = atlas.keyframe(kf).unwrap();
        assert_eq!(stored.timestamp_ns, 5);
        assert_eq!(stored.get_map_point(0), Some(mp));
        drop(atlas);
        assert_eq!(shared.all_keyframes(), vec![kf]);
        assert_eq!(shared.all_map_points()[0].num_observations(), 1);
    }
}
