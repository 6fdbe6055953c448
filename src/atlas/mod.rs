//! Atlas module - Multi-map keyframe/map-point graph store.
//!
//! The [`atlas::Atlas`] owns one or more [`map::Map`] arenas and tracks which
//! one is current. Thread-safe access goes through
//! [`SharedState`](crate::system::SharedState), which wraps the atlas in an
//! `RwLock`.

pub mod atlas;
pub mod map;

pub use atlas::{Atlas, MapIndex};
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
