//! Keyframe / map-point arena.
//!
//! - [`KeyFrame`]: pose, image, keypoints, plus the semantic label and masks
//! - [`MapPoint`]: 3D landmark carrying a moving probability
//! - [`Map`]: owns both and keeps their associations consistent
//!
//! Associations run both ways (a keyframe slot holds a [`MapPointId`], a map
//! point lists the keyframes observing it) and are plain integer handles, so a
//! queued [`KeyFrameId`] simply stops resolving once its keyframe is erased.
//!
//! ```ignore
//! use semantic_vslam::atlas::map::Map;
//!
//! let mut map = Map::new();
//! let kf_id = map.create_keyframe(timestamp, pose, image, keypoints);
//! let mp_id = map.create_map_point(position, kf_id);
//! map.associate(kf_id, feature_idx, mp_id);
//! ```

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::{MapPoint, MOVING_PROBABILITY_PRIOR};
pub use types::{KeyFrameId, MapPointId};
