//! Dynamic-object masks from segmentation labels.
//!
//! A label image holds one class id per pixel. The raw mask marks every pixel
//! whose class is dynamic with 1 and everything else with 0. The working mask
//! is the raw mask dilated with an elliptical (disk) structuring element, so
//! features right next to a moving object are treated as part of it.

use std::sync::Arc;
use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_dilate, Mask};
use tracing::{debug, warn};

use crate::atlas::map::KeyFrameId;

use super::config::DynamicClasses;
use super::diagnostics::DiagnosticSink;
use super::stats::SemanticStats;

/// Raw and dilated masks of one keyframe. Both hold 0/1 per pixel.
#[derive(Debug, Clone)]
pub struct SemanticMasks {
    pub raw: GrayImage,
    pub dilated: GrayImage,
}

/// Turns labels into binary masks.
pub struct MaskGenerator {
    dynamic_labels: Vec<u8>,
    /// None when dilation is disabled; the raw mask is then used as is.
    kernel: Option<Mask>,
    sink: Arc<dyn DiagnosticSink>,
}

impl MaskGenerator {
    pub fn new(
        classes: &DynamicClasses,
        dilate: bool,
        dilation_radius: u8,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let kernel = (dilate && dilation_radius > 0).then(|| Mask::disk(dilation_radius));
        Self {
            dynamic_labels: classes.label_ids(),
            kernel,
            sink,
        }
    }

    /// Binary mask: 1 where the label is a dynamic class.
    pub fn raw_mask(&self, label: &GrayImage) -> GrayImage {
        let mut mask = GrayImage::new(label.width(), label.height());
        for (x, y, px) in label.enumerate_pixels() {
            if self.dynamic_labels.contains(&px[0]) {
                mask.put_pixel(x, y, Luma([1]));
            }
        }
        mask
    }

    /// Build both masks for `label`.
    ///
    /// Returns None for an empty label. Elapsed time is recorded in `stats`
    /// and the intermediate images go to the diagnostic sink.
    pub fn generate(
        &self,
        kf_id: KeyFrameId,
        label: &GrayImage,
        stats: &SemanticStats,
    ) -> Option<SemanticMasks> {
        if label.width() == 0 || label.height() == 0 {
            warn!("{}: empty label, no mask generated", kf_id);
            return None;
        }
        let start = Instant::now();

        let raw = self.raw_mask(label);
        let dilated = match &self.kernel {
            Some(kernel) => grayscale_dilate(&raw, kernel),
            None => raw.clone(),
        };

        stats.record_mask_generation(start.elapsed());
        debug!(
            "{}: mask generated ({} dynamic px, {} after dilation)",
            kf_id,
            count_set(&raw),
            count_set(&dilated)
        );

        self.sink.save_label(kf_id, label);
        self.sink.save_raw_mask(kf_id, &raw);
        self.sink.save_dilated_mask(kf_id, &dilated);

        Some(SemanticMasks { raw, dilated })
    }
}

fn count_set(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}
