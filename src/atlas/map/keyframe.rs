//! KeyFrame - A selected frame together with its semantic annotations.
//!
//! Besides the geometric data handed over by the tracking front-end (pose,
//! keypoints, map point associations) a KeyFrame carries the results of the
//! semantic pipeline:
//! - the per-pixel class label returned by the segmentation service
//! - the raw binary mask of dynamic classes and its dilated variant
//! - the `semantic_ready` flag, set once a usable mask exists

use std::sync::Arc;

use image::{GrayImage, RgbImage};
use nalgebra::Point2;

use crate::geometry::SE3;

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    /// Unique identifier, monotonically increasing across the atlas.
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    /// Source color image. Shared so segmentation batches can hold it
    /// without copying pixels.
    pub image: Arc<RgbImage>,

    // ─────────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Keypoint pixel coordinates, one per feature.
    pub keypoints: Vec<Point2<f64>>,

    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Semantic annotations
    // ─────────────────────────────────────────────────────────────────────────
    /// Per-pixel class label from the segmentation service.
    pub label: Option<GrayImage>,

    /// Binary (0/1) mask of dynamic classes before dilation.
    pub raw_mask: Option<GrayImage>,

    /// Dilated mask used for moving probability updates.
    pub mask: Option<GrayImage>,

    /// Set once the label has been turned into a mask.
    semantic_ready: bool,

    /// Whether the keyframe is currently waiting in the segmentation queue.
    pub in_semantic_queue: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Temporal chain / status
    // ─────────────────────────────────────────────────────────────────────────
    /// Previous KeyFrame in temporal order.
    pub prev_kf: Option<KeyFrameId>,

    /// Whether this KeyFrame is marked as bad (to be removed).
    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a new KeyFrame with one (empty) map point slot per keypoint.
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        image: Arc<RgbImage>,
        keypoints: Vec<Point2<f64>>,
    ) -> Self {
        let num_features = keypoints.len();
        Self {
            id,
            timestamp_ns,
            pose,
            image,
            keypoints,
            map_point_ids: vec![None; num_features],
            label: None,
            raw_mask: None,
            mask: None,
            semantic_ready: false,
            in_semantic_queue: false,
            prev_kf: None,
            is_bad: false,
        }
    }

    /// Whether the label has been processed into a mask.
    pub fn is_semantic_ready(&self) -> bool {
        self.semantic_ready
    }

    /// Store the raw and dilated masks and mark the keyframe ready.
    ///
    /// An empty dilated mask is rejected: both masks stay unset, the flag is
    /// untouched and false is returned.
    pub fn apply_masks(&mut self, raw: GrayImage, dilated: GrayImage) -> bool {
        if dilated.width() == 0 || dilated.height() == 0 {
            return false;
        }
        self.raw_mask = Some(raw);
        self.mask = Some(dilated);
        self.semantic_ready = true;
        true
    }

    /// Whether a non-empty dilated mask is present.
    pub fn has_mask(&self) -> bool {
        self.mask
            .as_ref()
            .map(|m| m.width() > 0 && m.height() > 0)
            .unwrap_or(false)
    }

    /// MapPoint associated with feature `idx`.
    pub fn get_map_point(&self, idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(idx).copied().flatten()
    }

    /// Set the MapPoint association of feature `idx`.
    ///
    /// Returns false if the index is out of range.
    pub fn set_map_point(&mut self, idx: usize, mp_id: Option<MapPointId>) -> bool {
        match self.map_point_ids.get_mut(idx) {
            Some(slot) => {
                *slot = mp_id;
                true
            }
            None => false,
        }
    }

    /// Iterate over (feature index, map point) pairs.
    pub fn observed_map_points(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    /// Number of associated map points.
    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|m| m.is_some()).count()
    }

    /// Mask value at a pixel, or None if there is no mask or the pixel lies
    /// on/outside the image border.
    pub fn mask_value_at(&self, uv: &Point2<f64>) -> Option<u8> {
        let mask = self.mask.as_ref()?;
        let (w, h) = mask.dimensions();
        if !(uv.x > 0.0 && uv.x < w as f64 && uv.y > 0.0 && uv.y < h as f64) {
            return None;
        }
        Some(mask.get_pixel(uv.x as u32, uv.y as u32)[0])
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("num_keypoints", &self.keypoints.len())
            .field("num_map_points", &self.num_map_points())
            .field("has_label", &self.label.is_some())
            .field("semantic_ready", &self.semantic_ready)
            .field("in_semantic_queue", &self.in_semantic_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn test_keyframe() -> KeyFrame {
        KeyFrame::new(
            KeyFrameId::new(0),
            0,
            SE3::identity(),
            Arc::new(RgbImage::new(8, 6)),
            vec![Point2::new(2.0, 2.0), Point2::new(5.5, 4.5)],
        )
    }

    #[test]
    fn test_masks_mark_ready() {
        let mut kf = test_keyframe();
        assert!(!kf.is_semantic_ready());
        assert!(kf.apply_masks(GrayImage::new(8, 6), GrayImage::new(8, 6)));
        assert!(kf.is_semantic_ready());
        assert!(kf.has_mask());
        assert!(kf.raw_mask.is_some());
    }

    #[test]
    fn test_empty_mask_left_unset() {
        let mut kf = test_keyframe();
        assert!(!kf.apply_masks(GrayImage::new(8, 6), GrayImage::new(0, 0)));
        assert!(!kf.is_semantic_ready());
        assert!(kf.mask.is_none());
        assert!(kf.raw_mask.is_none());
        assert!(!kf.has_mask());
    }

    #[test]
    fn test_mask_value_lookup() {
        let mut kf = test_keyframe();
        let mut mask = GrayImage::new(8, 6);
        mask.put_pixel(5, 4, Luma([1]));
        kf.mask = Some(mask);

        assert_eq!(kf.mask_value_at(&Point2::new(5.5, 4.5)), Some(1));
        assert_eq!(kf.mask_value_at(&Point2::new(2.0, 2.0)), Some(0));
        // Border and outside pixels are rejected
        assert_eq!(kf.mask_value_at(&Point2::new(0.0, 2.0)), None);
        assert_eq!(kf.mask_value_at(&Point2::new(8.0, 2.0)), None);
    }

    #[test]
    fn test_map_point_slots() {
        let mut kf = test_keyframe();
        assert!(kf.set_map_point(1, Some(MapPointId::new(9))));
        assert!(!kf.set_map_point(5, Some(MapPointId::new(9))));
        assert_eq!(kf.get_map_point(1), Some(MapPointId::new(9)));
        assert_eq!(
            kf.observed_map_points().collect::<Vec<_>>(),
            vec![(1, MapPointId::new(9))]
        );
    }
}
