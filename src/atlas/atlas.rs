//! Atlas - multi-map container.
//!
//! The Atlas owns one or more `Map` instances:
//! - One **current** map where tracking and the semantic pipeline operate.
//! - Zero or more stored maps left behind by resets.
//!
//! The current map is created lazily on first access. New maps continue the
//! id counters of the previous ones, so a `KeyFrameId` or `MapPointId` is
//! unique across the whole atlas and lookups by handle do not need to know
//! which map the entity lives in.

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};

/// Index of a map inside the Atlas.
pub type MapIndex = usize;

/// Top‑level multi‑map container.
pub struct Atlas {
    /// All maps managed by the Atlas.
    maps: Vec<Map>,
    /// Index of the current map, None until first use.
    current_map_idx: Option<MapIndex>,
}

impl Atlas {
    /// Create an Atlas without any map. The first map is created on demand.
    pub fn new() -> Self {
        Self {
            maps: Vec::new(),
            current_map_idx: None,
        }
    }

    /// Number of maps in the Atlas.
    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    /// Index of the current map, creating it on first use.
    pub fn current_map_index(&mut self) -> MapIndex {
        match self.current_map_idx {
            Some(idx) => idx,
            None => self.create_new_map(),
        }
    }

    /// The current map, if one has been created.
    pub fn current_map(&self) -> Option<&Map> {
        self.current_map_idx.map(|idx| &self.maps[idx])
    }

    /// Mutable access to the current map, creating it on first use.
    pub fn current_map_mut(&mut self) -> &mut Map {
        let idx = self.current_map_index();
        &mut self.maps[idx]
    }

    /// Map by index.
    pub fn map(&self, idx: MapIndex) -> Option<&Map> {
        self.maps.get(idx)
    }

    /// Mutable map by index.
    pub fn map_mut(&mut self, idx: MapIndex) -> Option<&mut Map> {
        self.maps.get_mut(idx)
    }

    /// Immutable slice of all maps.
    pub fn all_maps(&self) -> &[Map] {
        &self.maps
    }

    /// Create a new empty map and make it the current one.
    ///
    /// Returns the index of the newly created map.
    pub fn create_new_map(&mut self) -> MapIndex {
        let next_kf = self.maps.iter().map(Map::next_kf_id).max().unwrap_or(0);
        let next_mp = self.maps.iter().map(Map::next_mp_id).max().unwrap_or(0);
        let idx = self.maps.len();
        tracing::info!("Creating map {} (first keyframe id {})", idx, next_kf);
        self.maps.push(Map::with_init_ids(idx, next_kf, next_mp));
        self.current_map_idx = Some(idx);
        idx
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handle lookups across maps
    // ─────────────────────────────────────────────────────────────────────────

    /// Find a KeyFrame by handle in any map.
    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.maps.iter().find_map(|m| m.get_keyframe(id))
    }

    /// Find a KeyFrame by handle in any map (mutable).
    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.maps.iter_mut().find_map(|m| m.get_keyframe_mut(id))
    }

    /// Find a MapPoint by handle in any map.
    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.maps.iter().find_map(|m| m.get_map_point(id))
    }

    /// Find a MapPoint by handle in any map (mutable).
    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.maps.iter_mut().find_map(|m| m.get_map_point_mut(id))
    }

    /// Remove a KeyFrame from whichever map holds it.
    pub fn erase_keyframe(&mut self, id: KeyFrameId) -> Option<KeyFrame> {
        self.maps.iter_mut().find_map(|m| m.remove_keyframe(id))
    }

    /// All KeyFrame handles, ascending.
    pub fn all_keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.maps.iter().flat_map(|m| m.keyframe_ids()).collect();
        ids.sort_unstable();
        ids
    }

    /// Copy of every MapPoint, ordered by handle.
    pub fn all_map_points(&self) -> Vec<MapPoint> {
        let mut points: Vec<MapPoint> = self
            .maps
            .iter()
            .flat_map(|m| m.map_points().cloned())
            .collect();
        points.sort_unstable_by_key(|mp| mp.id);
        points
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::RgbImage;
    use nalgebra::Vector3;

    use super::*;
    use crate::geometry::SE3;

    #[test]
    fn test_current_map_is_lazy() {
        let mut atlas = Atlas::new();
        assert_eq!(atlas.num_maps(), 0);
        assert!(atlas.current_map().is_none());

        let idx = atlas.current_map_index();
        assert_eq!(idx, 0);
        assert_eq!(atlas.num_maps(), 1);
        // Second access reuses the map
        assert_eq!(atlas.current_map_index(), 0);
    }

    #[test]
    fn test_ids_unique_across_maps() {
        let mut atlas = Atlas::new();
        let image = Arc::new(RgbImage::new(4, 4));
        let kf0 = atlas
            .current_map_mut()
            .create_keyframe(0, SE3::identity(), image.clone(), vec![]);
        let mp0 = atlas
            .current_map_mut()
            .create_map_point(Vector3::new(0.0, 0.0, 1.0), kf0);

        atlas.create_new_map();
        let kf1 = atlas
            .current_map_mut()
            .create_keyframe(1, SE3::identity(), image, vec![]);
        let mp1 = atlas
            .current_map_mut()
            .create_map_point(Vector3::new(0.0, 0.0, 1.0), kf1);

        assert!(kf1 > kf0);
        assert_ne!(mp0, mp1);
        assert!(atlas.keyframe(kf0).is_some());
        assert!(atlas.keyframe(kf1).is_some());
        assert_eq!(atlas.all_keyframe_ids(), vec![kf0, kf1]);
        assert_eq!(atlas.all_map_points().len(), 2);
    }

    #[test]
    fn test_erase_keyframe() {
        let mut atlas = Atlas::new();
        let kf = atlas.current_map_mut().create_keyframe(
            0,
            SE3::identity(),
            Arc::new(RgbImage::new(4, 4)),
            vec![],
        );
        assert!(atlas.erase_keyframe(kf).is_some());
        assert!(atlas.keyframe(kf).is_none());
        assert!(atlas.erase_keyframe(kf).is_none());
    }
}
