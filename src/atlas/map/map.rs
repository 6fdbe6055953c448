//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is an arena: KeyFrames and MapPoints are owned here and referred
//! to everywhere else by [`KeyFrameId`] / [`MapPointId`] handles. It provides
//! methods for:
//! - Creating/removing KeyFrames and creating MapPoints
//! - Creating bidirectional associations (KF↔MP)
//! - Snapshots of the current content

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbImage;
use nalgebra::{Point2, Vector3};

use crate::geometry::SE3;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    /// Index of this map inside its atlas.
    id: usize,

    /// All KeyFrames in the map.
    keyframes: HashMap<KeyFrameId, KeyFrame>,

    /// All MapPoints in the map.
    map_points: HashMap<MapPointId, MapPoint>,

    /// Counter for generating unique KeyFrame IDs.
    next_kf_id: u64,

    /// Counter for generating unique MapPoint IDs.
    next_mp_id: u64,

    /// Most recent KeyFrame ID (tail of temporal chain).
    last_keyframe_id: Option<KeyFrameId>,

    /// Set while the map is being reset or merged; readers must wait.
    is_bad: bool,
}

impl Map {
    /// Create a new empty Map whose ids start at zero.
    pub fn new() -> Self {
        Self::with_init_ids(0, 0, 0)
    }

    /// Create a new empty Map handing out ids starting at the given values.
    ///
    /// Used by the atlas so ids stay unique across maps.
    pub fn with_init_ids(id: usize, init_kf_id: u64, init_mp_id: u64) -> Self {
        Self {
            id,
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: init_kf_id,
            next_mp_id: init_mp_id,
            last_keyframe_id: None,
            is_bad: false,
        }
    }

    /// Whether the map is currently invalid (being reset or merged).
    pub fn is_bad(&self) -> bool {
        self.is_bad
    }

    pub fn set_bad(&mut self, bad: bool) {
        self.is_bad = bad;
    }

    /// Next KeyFrame id this map would hand out.
    pub fn next_kf_id(&self) -> u64 {
        self.next_kf_id
    }

    /// Next MapPoint id this map would hand out.
    pub fn next_mp_id(&self) -> u64 {
        self.next_mp_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame to the map.
    ///
    /// Links the new keyframe to the previous one in temporal order.
    pub fn create_keyframe(
        &mut self,
        timestamp_ns: u64,
        pose: SE3,
        image: Arc<RgbImage>,
        keypoints: Vec<Point2<f64>>,
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        let kf = KeyFrame::new(id, timestamp_ns, pose, image, keypoints);
        self.add_keyframe(kf);
        id
    }

    /// Add an existing KeyFrame to the map.
    ///
    /// A KeyFrame whose id is already present is refused and the map is left
    /// untouched. Returns whether it was inserted.
    pub fn add_keyframe(&mut self, mut kf: KeyFrame) -> bool {
        if self.keyframes.contains_key(&kf.id) {
            return false;
        }
        if kf.id.0 >= self.next_kf_id {
            self.next_kf_id = kf.id.0 + 1;
        }
        if kf.prev_kf.is_none() {
            kf.prev_kf = self.last_keyframe_id;
        }
        if self.last_keyframe_id.map_or(true, |last| kf.id > last) {
            self.last_keyframe_id = Some(kf.id);
        }
        self.keyframes.insert(kf.id, kf);
        true
    }

    /// Get a KeyFrame by ID.
    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    /// Get a mutable reference to a KeyFrame by ID.
    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// All KeyFrame IDs in ascending order.
    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Fully remove a KeyFrame, detaching it from the MapPoints it observes.
    pub fn remove_keyframe(&mut self, kf_id: KeyFrameId) -> Option<KeyFrame> {
        let kf = self.keyframes.remove(&kf_id)?;

        for (_, mp_id) in kf.observed_map_points() {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }

        // Relink the temporal chain around the removed keyframe
        for other in self.keyframes.values_mut() {
            if other.prev_kf == Some(kf_id) {
                other.prev_kf = kf.prev_kf;
            }
        }
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = kf.prev_kf;
        }

        Some(kf)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new MapPoint to the map.
    pub fn create_map_point(&mut self, position: Vector3<f64>, first_kf_id: KeyFrameId) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, first_kf_id));
        id
    }

    /// Get a MapPoint by ID.
    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    /// Get a mutable reference to a MapPoint by ID.
    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Get all MapPoints.
    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }


    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// Returns true if the association was created successfully.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if !self.map_points.contains_key(&mp_id) {
            return false;
        }
        let linked = match self.keyframes.get_mut(&kf_id) {
            Some(kf) => kf.set_map_point(feature_idx, Some(mp_id)),
            None => false,
        };
        if !linked {
            return false;
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        true
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
