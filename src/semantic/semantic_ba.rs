//! Optional semantic bundle adjustment thread.
//!
//! Lags behind semantic tracking on purpose: a keyframe is only refined once
//! several newer ones are queued behind it, so that the moving probabilities
//! of its points have seen more evidence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::atlas::map::KeyFrameId;
use crate::optimizer::PoseOptimizer;
use crate::system::messages::{WorkerEvent, WorkerKind};

use super::context::SemanticContext;

pub struct SemanticBundleAdjuster {
    ctx: Arc<SemanticContext>,
    optimizer: Arc<dyn PoseOptimizer>,
}

impl SemanticBundleAdjuster {
    pub fn new(ctx: Arc<SemanticContext>, optimizer: Arc<dyn PoseOptimizer>) -> Self {
        Self { ctx, optimizer }
    }

    fn upstream_done(&self) -> bool {
        self.ctx.is_finish_requested() && self.ctx.is_tracking_stopped()
    }

    /// Thread entry point.
    ///
    /// Received keyframes wait in a local backlog until more than
    /// `min_queue_len` are pending; on finish the backlog is flushed.
    pub fn run(&self, events: Sender<WorkerEvent>) {
        let ctx = &self.ctx;
        let idle = ctx.config.idle_wait();
        let min_len = ctx.config.semantic_ba.min_queue_len;
        let mut backlog: VecDeque<KeyFrameId> = VecDeque::new();
        loop {
            match ctx.ba_queue.recv_timeout(idle) {
                Ok(kf_id) => backlog.push_back(kf_id),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            backlog.extend(ctx.ba_queue.drain());

            let finishing = ctx.is_finish_requested();
            while backlog.len() > min_len || (finishing && !backlog.is_empty()) {
                let Some(kf_id) = backlog.pop_front() else {
                    break;
                };
                self.process(kf_id);
            }

            if self.upstream_done() && backlog.is_empty() && ctx.ba_queue.is_empty() {
                break;
            }
        }

        debug!("Semantic BA worker stopped");
        let _ = events.send(WorkerEvent::Stopped(WorkerKind::SemanticBA));
    }

    /// Refine one keyframe. Returns true if the optimizer ran.
    pub fn process(&self, kf_id: KeyFrameId) -> bool {
        let ctx = &self.ctx;
        if kf_id.0 <= ctx.config.semantic_ba.warmup_keyframes {
            return false;
        }
        if ctx.shared.atlas.read().keyframe(kf_id).is_none() {
            warn!("{} erased before semantic BA", kf_id);
            return false;
        }

        let start = Instant::now();
        let result = self.optimizer.optimize_with_semantics(&ctx.shared, kf_id);
        ctx.stats.record_semantic_ba(start.elapsed());
        match result {
            Ok(report) => {
                debug!(
                    "{}: semantic BA refined {} keyframes",
                    kf_id, report.keyframes_optimized
                );
                true
            }
            Err(e) => {
                warn!("{}: semantic BA failed: {:#}", kf_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use image::RgbImage;
    use parking_lot::Mutex;

    use super::*;
    use crate::geometry::SE3;
    use crate::optimizer::PoseOptimizationReport;
    use crate::semantic::config::SemanticConfig;
    use crate::system::SharedState;

    #[derive(Default)]
    struct Recorder {
        semantic_calls: Mutex<Vec<KeyFrameId>>,
    }

    impl PoseOptimizer for Recorder {
        fn optimize_pose(
            &self,
            _store: &SharedState,
            _kf: KeyFrameId,
            _weight: bool,
        ) -> Result<PoseOptimizationReport> {
            Ok(PoseOptimizationReport::default())
        }

        fn optimize_with_semantics(
            &self,
            _store: &SharedState,
            kf: KeyFrameId,
        ) -> Result<PoseOptimizationReport> {
            self.semantic_calls.lock().push(kf);
            Ok(PoseOptimizationReport::default())
        }
    }

    fn setup(num_keyframes: usize) -> (Arc<SemanticContext>, Vec<KeyFrameId>) {
        let mut config = SemanticConfig::default();
        config.semantic_ba.enabled = true;
        let classes = config.dynamic_classes().unwrap();
        let ctx = Arc::new(SemanticContext::new(config, classes, SharedState::new()));
        let ids = (0..num_keyframes)
            .map(|i| {
                ctx.shared
                    .create_keyframe(i as u64, SE3::identity(), Arc::new(RgbImage::new(4, 4)), vec![])
                    .unwrap()
            })
            .collect();
        (ctx, ids)
    }

    #[test]
    fn test_warmup_skipped() {
        let (ctx, ids) = setup(5);
        let recorder = Arc::new(Recorder::default());
        let ba = SemanticBundleAdjuster::new(Arc::clone(&ctx), recorder.clone());
        let ran: Vec<bool> = ids.iter().map(|&id| ba.process(id)).collect();
        assert_eq!(ran, vec![false, false, false, false, true]);
        assert_eq!(*recorder.semantic_calls.lock(), vec![ids[4]]);
    }

    #[test]
    fn test_run_flushes_queue_on_finish() {
        let (ctx, ids) = setup(6);
        for &id in &ids {
            ctx.ba_queue.push(id);
        }
        let recorder = Arc::new(Recorder::default());
        let ba = SemanticBundleAdjuster::new(Arc::clone(&ctx), recorder.clone());
        let (tx, rx) = crossbeam_channel::unbounded();

        ctx.mark_tracking_stopped();
        ctx.request_finish();
        ba.run(tx);

        assert!(ctx.ba_queue.is_empty());
        assert_eq!(*recorder.semantic_calls.lock(), vec![ids[4], ids[5]]);
        assert_eq!(rx.try_recv(), Ok(WorkerEvent::Stopped(WorkerKind::SemanticBA)));
    }
}
