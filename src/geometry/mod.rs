//! Geometry utilities: SE3 transforms and the pinhole camera.

pub mod camera;
pub mod se3;

pub use camera::CameraModel;
pub use se3::SE3;
