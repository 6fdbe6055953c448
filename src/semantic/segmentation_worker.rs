//! Segmentation dispatcher thread.
//!
//! Waits for a batch of keyframes, sends their images to the segmentation
//! service in a single call, and applies the results keyframe by keyframe:
//!
//! 1. Store the label on the keyframe
//! 2. Generate raw and dilated masks
//! 3. Mark the keyframe semantic-ready
//! 4. Update the moving probability of its map points
//! 5. Raise the latest-labeled high-water mark
//! 6. Forward it to the semantic tracking queue
//!
//! A result list whose length differs from the batch invalidates the whole
//! batch. A missing or malformed label only fails its own keyframe.

use std::sync::Arc;

use crossbeam_channel::Sender;
use image::{GrayImage, RgbImage};
use tracing::{debug, error, info, warn};

use crate::atlas::map::KeyFrameId;
use crate::system::messages::{WorkerEvent, WorkerKind};

use super::context::SemanticContext;
use super::mask::MaskGenerator;
use super::probability::{update_moving_probabilities, MovingProbabilityPolicy};
use super::segmenter::{label_matches, SegmentationService, ServiceFactory};

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// KeyFrames sent to the service.
    pub submitted: usize,
    /// KeyFrames labeled and forwarded to tracking.
    pub labeled: usize,
    /// KeyFrames whose label or mask could not be produced.
    pub failed: usize,
    /// The whole batch was discarded.
    pub dropped: bool,
}

/// Dispatcher state. The service itself lives on the worker thread only.
pub struct SegmentationWorker {
    ctx: Arc<SemanticContext>,
    masks: MaskGenerator,
    policy: Box<dyn MovingProbabilityPolicy>,
}

impl SegmentationWorker {
    pub fn new(
        ctx: Arc<SemanticContext>,
        masks: MaskGenerator,
        policy: Box<dyn MovingProbabilityPolicy>,
    ) -> Self {
        Self { ctx, masks, policy }
    }

    /// Thread entry point.
    ///
    /// Creates the service, reports readiness, and loops until finish is
    /// requested and no full batch remains.
    pub fn run(&mut self, factory: ServiceFactory, events: Sender<WorkerEvent>) {
        let mut service = match factory() {
            Ok(service) => {
                info!("Segmentation service '{}' ready", service.name());
                let _ = events.send(WorkerEvent::ServiceReady);
                service
            }
            Err(e) => {
                error!("Failed to create segmentation service: {:#}", e);
                let _ = events.send(WorkerEvent::ServiceFailed(format!("{:#}", e)));
                self.ctx.mark_segmentation_stopped();
                let _ = events.send(WorkerEvent::Stopped(WorkerKind::Segmentation));
                return;
            }
        };

        let idle = self.ctx.config.idle_wait();
        loop {
            let ready = self
                .ctx
                .requests
                .wait_for_batch(idle, self.ctx.finish_flag());
            if ready {
                self.dispatch_once(service.as_mut());
                continue;
            }
            if self.ctx.is_finish_requested() {
                break;
            }
        }

        let leftover = self.ctx.requests.len();
        if leftover > 0 {
            info!("{} keyframes left unsegmented at shutdown", leftover);
        }
        drop(service);
        self.ctx.mark_segmentation_stopped();
        debug!("Segmentation worker stopped");
        let _ = events.send(WorkerEvent::Stopped(WorkerKind::Segmentation));
    }

    /// Drain the request queue and process one batch.
    pub fn dispatch_once(&self, service: &mut dyn SegmentationService) -> DispatchOutcome {
        let ctx = &self.ctx;
        let mut outcome = DispatchOutcome::default();

        let batch = ctx
            .requests
            .drain_and_filter(&ctx.shared, &ctx.tracking_queue, &ctx.stats);
        if batch.is_empty() {
            return outcome;
        }

        // Snapshot images; handles erased since the drain are dropped here
        let (kf_ids, images): (Vec<KeyFrameId>, Vec<Arc<RgbImage>>) = {
            let atlas = ctx.shared.atlas.read();
            batch
                .into_iter()
                .filter_map(|kf_id| match atlas.keyframe(kf_id) {
                    Some(kf) => Some((kf_id, Arc::clone(&kf.image))),
                    None => {
                        warn!("{} erased before segmentation", kf_id);
                        ctx.stats.record_missing_keyframe();
                        None
                    }
                })
                .unzip()
        };
        if kf_ids.is_empty() {
            return outcome;
        }
        outcome.submitted = kf_ids.len();

        info!("Segmenting batch of {} keyframes", kf_ids.len());
        let labels = match service.segment(&images) {
            Ok(labels) => labels,
            Err(e) => {
                error!("Segmentation service failed, batch dropped: {:#}", e);
                self.drop_batch(&kf_ids);
                outcome.dropped = true;
                return outcome;
            }
        };
        if labels.len() != kf_ids.len() {
            error!(
                "Segmentation returned {} results for {} images, batch dropped",
                labels.len(),
                kf_ids.len()
            );
            self.drop_batch(&kf_ids);
            outcome.dropped = true;
            return outcome;
        }

        for ((kf_id, image), label) in kf_ids.into_iter().zip(&images).zip(labels) {
            let (w, h) = image.dimensions();
            let label = match label {
                Some(label) if label_matches(&label, w, h) => label,
                Some(label) => {
                    warn!(
                        "{}: label is {}x{}, image is {}x{}, skipped",
                        kf_id,
                        label.width(),
                        label.height(),
                        w,
                        h
                    );
                    self.fail_keyframe(kf_id);
                    outcome.failed += 1;
                    continue;
                }
                None => {
                    warn!("{}: no segmentation result, skipped", kf_id);
                    self.fail_keyframe(kf_id);
                    outcome.failed += 1;
                    continue;
                }
            };

            if self.apply_label(kf_id, label) {
                outcome.labeled += 1;
            } else {
                outcome.failed += 1;
            }
        }

        debug!(
            "Batch done: {} labeled, {} failed",
            outcome.labeled, outcome.failed
        );
        outcome
    }

    /// Steps 1-6 for one keyframe. Returns false if the keyframe was not
    /// forwarded.
    fn apply_label(&self, kf_id: KeyFrameId, label: GrayImage) -> bool {
        let ctx = &self.ctx;

        match ctx.shared.atlas.write().keyframe_mut(kf_id) {
            Some(kf) => kf.label = Some(label.clone()),
            None => {
                warn!("{} erased while its label was applied", kf_id);
                ctx.stats.record_missing_keyframe();
                return false;
            }
        }

        let Some(masks) = self.masks.generate(kf_id, &label, &ctx.stats) else {
            self.fail_keyframe(kf_id);
            return false;
        };

        {
            let mut atlas = ctx.shared.atlas.write();
            let Some(kf) = atlas.keyframe_mut(kf_id) else {
                warn!("{} erased while its mask was applied", kf_id);
                ctx.stats.record_missing_keyframe();
                return false;
            };
            kf.in_semantic_queue = false;
            if !kf.apply_masks(masks.raw, masks.dilated) {
                warn!("{}: empty mask, not marked ready", kf_id);
                ctx.stats.record_failure();
                return false;
            }
        }

        update_moving_probabilities(&ctx.shared, kf_id, self.policy.as_ref(), &ctx.stats);
        ctx.record_labeled(kf_id);

        let delay = ctx
            .requests
            .latest_enqueued()
            .map_or(0, |latest| latest.0.saturating_sub(kf_id.0));
        ctx.stats.record_segmented(delay);

        ctx.tracking_queue.push(kf_id);
        true
    }

    /// Record a per-keyframe failure and release it for re-queueing.
    fn fail_keyframe(&self, kf_id: KeyFrameId) {
        self.ctx.stats.record_failure();
        if let Some(kf) = self.ctx.shared.atlas.write().keyframe_mut(kf_id) {
            kf.in_semantic_queue = false;
        }
    }

    /// Discard a batch, releasing its keyframes for re-queueing.
    fn drop_batch(&self, kf_ids: &[KeyFrameId]) {
        self.ctx.stats.record_dropped_batch();
        let mut atlas = self.ctx.shared.atlas.write();
        for &kf_id in kf_ids {
            if let Some(kf) = atlas.keyframe_mut(kf_id) {
                kf.in_semantic_queue = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{bail, Result};
    use image::Luma;
    use nalgebra::{Point2, Vector3};

    use super::*;
    use crate::atlas::map::{MapPointId, MOVING_PROBABILITY_PRIOR};
    use crate::geometry::SE3;
    use crate::semantic::config::SemanticConfig;
    use crate::semantic::diagnostics::NoopSink;
    use crate::semantic::probability::BayesianUpdate;
    use crate::system::SharedState;

    const W: u32 = 32;
    const H: u32 = 24;

    /// Labels every image whose top-left pixel is red as all-person.
    struct RedIsPerson {
        calls: Arc<AtomicUsize>,
    }

    impl SegmentationService for RedIsPerson {
        fn segment(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(images
                .iter()
                .map(|img| {
                    let class = if img.get_pixel(0, 0)[0] > 128 { 1 } else { 0 };
                    Some(GrayImage::from_pixel(img.width(), img.height(), Luma([class])))
                })
                .collect())
        }
    }

    struct ShortResult;

    impl SegmentationService for ShortResult {
        fn segment(&mut self, _images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>> {
            Ok(vec![Some(GrayImage::new(W, H))])
        }
    }

    struct Failing;

    impl SegmentationService for Failing {
        fn segment(&mut self, _images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>> {
            bail!("model crashed")
        }
    }

    struct Fixture {
        ctx: Arc<SemanticContext>,
        worker: SegmentationWorker,
    }

    fn fixture() -> Fixture {
        let config = SemanticConfig {
            dilation_radius: 2,
            ..SemanticConfig::default()
        };
        let classes = config.dynamic_classes().unwrap();
        let masks = MaskGenerator::new(&classes, config.dilate, config.dilation_radius, Arc::new(NoopSink));
        let ctx = Arc::new(SemanticContext::new(config, classes, SharedState::new()));
        let worker = SegmentationWorker::new(
            Arc::clone(&ctx),
            masks,
            Box::new(BayesianUpdate {
                dynamic_likelihood: 0.7,
            }),
        );
        Fixture { ctx, worker }
    }

    /// KeyFrame with one observed point in the image center.
    fn keyframe(ctx: &SemanticContext, red: bool) -> (KeyFrameId, MapPointId) {
        let color = if red { [255, 0, 0] } else { [0, 0, 255] };
        let image = Arc::new(RgbImage::from_pixel(W, H, image::Rgb(color)));
        let kf = ctx
            .shared
            .create_keyframe(0, SE3::identity(), image, vec![Point2::new(16.0, 12.0)])
            .unwrap();
        let mp = ctx
            .shared
            .create_map_point(Vector3::new(0.0, 0.0, 1.0), kf)
            .unwrap();
        assert!(ctx.shared.associate(kf, 0, mp));
        (kf, mp)
    }

    fn enqueue(ctx: &SemanticContext, kf: KeyFrameId) {
        ctx.shared.atlas.write().keyframe_mut(kf).unwrap().in_semantic_queue = true;
        ctx.requests.enqueue(kf);
    }

    #[test]
    fn test_static_and_dynamic_keyframes() {
        let Fixture { ctx, worker } = fixture();
        let (kf_a, mp_a) = keyframe(&ctx, false);
        let (kf_b, mp_b) = keyframe(&ctx, true);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);
        assert!(ctx.requests.is_batch_ready());

        let calls = Arc::new(AtomicUsize::new(0));
        let mut service = RedIsPerson {
            calls: Arc::clone(&calls),
        };
        let outcome = worker.dispatch_once(&mut service);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.labeled, 2);
        assert!(ctx.shared.moving_probability(mp_a).unwrap() <= MOVING_PROBABILITY_PRIOR);
        assert!(ctx.shared.moving_probability(mp_b).unwrap() > MOVING_PROBABILITY_PRIOR);
        assert_eq!(ctx.tracking_queue.drain(), vec![kf_a, kf_b]);
        assert_eq!(ctx.latest_labeled(), Some(kf_b));

        let atlas = ctx.shared.atlas.read();
        for kf in [kf_a, kf_b] {
            let frame = atlas.keyframe(kf).unwrap();
            assert!(frame.is_semantic_ready());
            assert!(frame.has_mask());
            assert!(frame.label.is_some());
            assert!(!frame.in_semantic_queue);
        }
    }

    #[test]
    fn test_ready_keyframes_bypass_service() {
        let Fixture { ctx, worker } = fixture();
        let (kf_a, _) = keyframe(&ctx, false);
        let (kf_b, _) = keyframe(&ctx, true);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);

        let calls = Arc::new(AtomicUsize::new(0));
        let mut service = RedIsPerson {
            calls: Arc::clone(&calls),
        };
        worker.dispatch_once(&mut service);
        ctx.tracking_queue.drain();

        // Both are ready now; re-queueing them must not reach the service
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);
        let outcome = worker.dispatch_once(&mut service);
        assert_eq!(outcome, DispatchOutcome::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.tracking_queue.drain(), vec![kf_a, kf_b]);
        assert_eq!(ctx.stats.summary().rerouted, 2);
    }

    #[test]
    fn test_count_mismatch_drops_batch() {
        let Fixture { ctx, worker } = fixture();
        let (kf_a, mp_a) = keyframe(&ctx, true);
        let (kf_b, _) = keyframe(&ctx, true);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);

        let outcome = worker.dispatch_once(&mut ShortResult);
        assert!(outcome.dropped);
        assert_eq!(outcome.labeled, 0);
        assert!(ctx.tracking_queue.is_empty());
        assert_eq!(ctx.shared.moving_probability(mp_a), Some(MOVING_PROBABILITY_PRIOR));
        assert_eq!(ctx.stats.summary().dropped_batches, 1);
        assert_eq!(ctx.latest_labeled(), None);

        let atlas = ctx.shared.atlas.read();
        assert!(!atlas.keyframe(kf_a).unwrap().in_semantic_queue);
        assert!(!atlas.keyframe(kf_a).unwrap().is_semantic_ready());
    }

    #[test]
    fn test_service_error_drops_batch() {
        let Fixture { ctx, worker } = fixture();
        let (kf_a, _) = keyframe(&ctx, true);
        let (kf_b, _) = keyframe(&ctx, false);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);

        let outcome = worker.dispatch_once(&mut Failing);
        assert!(outcome.dropped);
        assert!(ctx.tracking_queue.is_empty());
    }

    #[test]
    fn test_null_label_fails_only_its_keyframe() {
        struct SecondMissing;
        impl SegmentationService for SecondMissing {
            fn segment(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>> {
                Ok(vec![Some(GrayImage::new(images[0].width(), images[0].height())), None])
            }
        }

        let Fixture { ctx, worker } = fixture();
        let (kf_a, _) = keyframe(&ctx, false);
        let (kf_b, _) = keyframe(&ctx, false);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);

        let outcome = worker.dispatch_once(&mut SecondMissing);
        assert_eq!(outcome.labeled, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(ctx.tracking_queue.drain(), vec![kf_a]);

        let atlas = ctx.shared.atlas.read();
        let b = atlas.keyframe(kf_b).unwrap();
        assert!(!b.is_semantic_ready());
        assert!(!b.in_semantic_queue);
    }

    #[test]
    fn test_wrong_size_label_rejected() {
        struct Tiny;
        impl SegmentationService for Tiny {
            fn segment(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>> {
                Ok(images.iter().map(|_| Some(GrayImage::new(2, 2))).collect())
            }
        }

        let Fixture { ctx, worker } = fixture();
        let (kf_a, _) = keyframe(&ctx, false);
        let (kf_b, _) = keyframe(&ctx, false);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);

        let outcome = worker.dispatch_once(&mut Tiny);
        assert_eq!(outcome.failed, 2);
        assert!(ctx.tracking_queue.is_empty());
        assert_eq!(ctx.stats.summary().failed, 2);
    }

    #[test]
    fn test_semantic_delay_recorded() {
        let Fixture { ctx, worker } = fixture();
        let (kf_a, _) = keyframe(&ctx, false);
        let (kf_b, _) = keyframe(&ctx, false);
        let (kf_c, _) = keyframe(&ctx, false);
        enqueue(&ctx, kf_a);
        enqueue(&ctx, kf_b);
        enqueue(&ctx, kf_c);

        let mut service = RedIsPerson {
            calls: Arc::new(AtomicUsize::new(0)),
        };
        worker.dispatch_once(&mut service);
        // Delays 2, 1, 0
        assert!((ctx.stats.summary().mean_semantic_delay - 1.0).abs() < 1e-9);
    }
}
