//! State shared by the semantic workers and their controller.
//!
//! One `SemanticContext` exists per `SemanticSystem`; every worker holds an
//! `Arc` to it. It replaces process-wide globals: configuration, queues,
//! finish flag, statistics and the latest-labeled high-water mark all live
//! here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::atlas::map::KeyFrameId;
use crate::system::SharedState;

use super::config::{DynamicClasses, SemanticConfig};
use super::probability::DynamicClassifier;
use super::queue::{KeyFrameChannel, SegmentationRequestQueue};
use super::stats::SemanticStats;

pub struct SemanticContext {
    /// Read-only once the workers run.
    pub config: SemanticConfig,

    /// The map graph.
    pub shared: Arc<SharedState>,

    // ─────────────────────────────────────────────────────────────────────
    // Queues
    // ─────────────────────────────────────────────────────────────────────
    /// KeyFrames waiting for segmentation.
    pub requests: SegmentationRequestQueue,

    /// Labeled keyframes waiting for semantic pose optimization.
    pub tracking_queue: KeyFrameChannel,

    /// KeyFrames waiting for semantic BA (only fed when enabled).
    pub ba_queue: KeyFrameChannel,

    // ─────────────────────────────────────────────────────────────────────
    // Classification
    // ─────────────────────────────────────────────────────────────────────
    /// Dynamic class table; replaced only before the workers start.
    pub classes: RwLock<DynamicClasses>,

    pub classifier: DynamicClassifier,

    pub stats: SemanticStats,

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle flags
    // ─────────────────────────────────────────────────────────────────────
    finish_requested: AtomicBool,
    segmentation_stopped: AtomicBool,
    tracking_stopped: AtomicBool,

    /// Highest labeled keyframe id, stored as id + 1 (0 = none).
    latest_labeled: AtomicU64,
}

impl SemanticContext {
    pub fn new(
        config: SemanticConfig,
        classes: DynamicClasses,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            requests: SegmentationRequestQueue::new(config.batch_size, config.enabled),
            tracking_queue: KeyFrameChannel::new("semantic tracking"),
            ba_queue: KeyFrameChannel::new("semantic BA"),
            classes: RwLock::new(classes),
            classifier: DynamicClassifier::new(config.dynamic_threshold),
            stats: SemanticStats::default(),
            finish_requested: AtomicBool::new(false),
            segmentation_stopped: AtomicBool::new(false),
            tracking_stopped: AtomicBool::new(false),
            latest_labeled: AtomicU64::new(0),
            config,
            shared,
        }
    }

    pub fn is_finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_flag(&self) -> &AtomicBool {
        &self.finish_requested
    }

    /// Raise the finish flag and wake the dispatcher. The channel consumers
    /// notice it on their next receive timeout.
    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
        self.requests.wake_all();
    }

    /// Called by the dispatcher on exit; nothing reaches the tracking queue
    /// afterwards.
    pub fn mark_segmentation_stopped(&self) {
        self.segmentation_stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_segmentation_stopped(&self) -> bool {
        self.segmentation_stopped.load(Ordering::SeqCst)
    }

    /// Called by the tracking coordinator on exit; nothing reaches the BA
    /// queue afterwards.
    pub fn mark_tracking_stopped(&self) {
        self.tracking_stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_tracking_stopped(&self) -> bool {
        self.tracking_stopped.load(Ordering::SeqCst)
    }

    /// Raise the latest-labeled high-water mark. Never lowers it.
    pub fn record_labeled(&self, kf_id: KeyFrameId) {
        let prev = self
            .latest_labeled
            .fetch_max(kf_id.0.saturating_add(1), Ordering::SeqCst);
        if prev <= kf_id.0 {
            debug!("Latest labeled keyframe is now {}", kf_id);
        }
    }

    pub fn latest_labeled(&self) -> Option<KeyFrameId> {
        match self.latest_labeled.load(Ordering::SeqCst) {
            0 => None,
            v => Some(KeyFrameId::new(v - 1)),
        }
    }
}
