//! Boundary to the external instance-segmentation service.
//!
//! The pipeline never links a network runtime itself: it talks to whatever
//! implements [`SegmentationService`]. The service is created lazily on the
//! dispatcher thread through a [`ServiceFactory`], so models with thread
//! affinity are initialised and used on the same thread.

use std::sync::Arc;

use anyhow::Result;
use image::{GrayImage, RgbImage};

/// An instance-segmentation backend.
///
/// `segment` receives one batch of keyframe images and must return exactly one
/// entry per input, in order. Each entry is a single-channel label image of the
/// input's size holding a class id per pixel, or `None` when that image could
/// not be segmented. A result of the wrong length makes the whole batch invalid.
pub trait SegmentationService: Send {
    fn segment(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>>;

    /// Human readable name used in logs.
    fn name(&self) -> &str {
        "segmentation"
    }
}

/// Creates the service on the dispatcher thread.
pub type ServiceFactory = Box<dyn FnOnce() -> Result<Box<dyn SegmentationService>> + Send>;

/// Wrap a ready-made service into a factory.
pub fn factory_from<S>(service: S) -> ServiceFactory
where
    S: SegmentationService + 'static,
{
    Box::new(move || Ok(Box::new(service) as Box<dyn SegmentationService>))
}

/// Whether a label image is usable for a keyframe of the given size.
pub fn label_matches(label: &GrayImage, width: u32, height: u32) -> bool {
    label.width() > 0 && label.height() > 0 && label.dimensions() == (width, height)
}
