//! Optional dumps of intermediate semantic images.
//!
//! The mask generator hands every label and mask it produces to a
//! [`DiagnosticSink`]. The default sink discards them; [`DirectorySink`] writes
//! PNG files for offline inspection:
//!
//! ```text
//! <root>/label/<kf>.png        raw class-id label
//! <root>/mask/old_<kf>.png     binary mask before dilation (0 / 255)
//! <root>/mask/dilate_<kf>.png  dilated mask (0 / 255)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::GrayImage;
use tracing::warn;

use crate::atlas::map::KeyFrameId;

/// Receives intermediate images. Failures are logged, never propagated.
pub trait DiagnosticSink: Send + Sync {
    fn save_label(&self, _kf_id: KeyFrameId, _label: &GrayImage) {}
    fn save_raw_mask(&self, _kf_id: KeyFrameId, _mask: &GrayImage) {}
    fn save_dilated_mask(&self, _kf_id: KeyFrameId, _mask: &GrayImage) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {}

/// Writes PNG files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Create the `label/` and `mask/` sub-directories.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["label", "mask"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create diagnostics dir {:?}", dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn label_path(&self, kf_id: KeyFrameId) -> PathBuf {
        self.root.join("label").join(format!("{}.png", kf_id.0))
    }

    pub fn raw_mask_path(&self, kf_id: KeyFrameId) -> PathBuf {
        self.root.join("mask").join(format!("old_{}.png", kf_id.0))
    }

    pub fn dilated_mask_path(&self, kf_id: KeyFrameId) -> PathBuf {
        self.root.join("mask").join(format!("dilate_{}.png", kf_id.0))
    }

    fn write(path: &Path, image: &GrayImage) {
        if let Err(e) = image.save(path) {
            warn!("Failed to write {:?}: {}", path, e);
        }
    }
}

/// Masks hold 0/1; stretch them to 0/255 so the files are viewable.
fn visible(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for px in out.pixels_mut() {
        px[0] = if px[0] > 0 { 255 } else { 0 };
    }
    out
}

impl DiagnosticSink for DirectorySink {
    fn save_label(&self, kf_id: KeyFrameId, label: &GrayImage) {
        Self::write(&self.label_path(kf_id), label);
    }

    fn save_raw_mask(&self, kf_id: KeyFrameId, mask: &GrayImage) {
        Self::write(&self.raw_mask_path(kf_id), &visible(mask));
    }

    fn save_dilated_mask(&self, kf_id: KeyFrameId, mask: &GrayImage) {
        Self::write(&self.dilated_mask_path(kf_id), &visible(mask));
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn test_directory_sink_writes_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path()).unwrap();
        let kf = KeyFrameId::new(7);

        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(1, 1, Luma([1]));
        sink.save_label(kf, &GrayImage::new(4, 4));
        sink.save_raw_mask(kf, &mask);
        sink.save_dilated_mask(kf, &mask);

        assert!(sink.label_path(kf).ends_with("label/7.png"));
        assert!(sink.label_path(kf).exists());
        assert!(sink.raw_mask_path(kf).exists());

        let reloaded = image::open(sink.dilated_mask_path(kf)).unwrap().to_luma8();
        assert_eq!(reloaded.get_pixel(1, 1)[0], 255);
        assert_eq!(reloaded.get_pixel(0, 0)[0], 0);
    }
}
