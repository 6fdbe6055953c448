//! Semantic tracking coordinator thread.
//!
//! Consumes labeled keyframes in FIFO order and re-optimizes their pose with
//! the freshly updated moving probabilities. Map point positions are never
//! touched here.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::atlas::map::KeyFrameId;
use crate::optimizer::PoseOptimizer;
use crate::system::messages::{WorkerEvent, WorkerKind};

use super::context::SemanticContext;

pub struct SemanticTracker {
    ctx: Arc<SemanticContext>,
    optimizer: Arc<dyn PoseOptimizer>,
}

impl SemanticTracker {
    pub fn new(ctx: Arc<SemanticContext>, optimizer: Arc<dyn PoseOptimizer>) -> Self {
        Self { ctx, optimizer }
    }

    /// Thread entry point.
    ///
    /// Exits once finish is requested, the dispatcher has stopped feeding the
    /// channel, and the channel is empty.
    pub fn run(&self, events: Sender<WorkerEvent>) {
        let ctx = &self.ctx;
        let idle = ctx.config.idle_wait();
        loop {
            match ctx.tracking_queue.recv_timeout(idle) {
                Ok(kf_id) => {
                    self.process(kf_id);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.is_finish_requested()
                        && ctx.is_segmentation_stopped()
                        && ctx.tracking_queue.is_empty()
                    {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        ctx.mark_tracking_stopped();
        debug!("Semantic tracking worker stopped");
        let _ = events.send(WorkerEvent::Stopped(WorkerKind::Tracking));
    }

    /// Optimize one labeled keyframe. Returns true if the optimizer ran.
    pub fn process(&self, kf_id: KeyFrameId) -> bool {
        let ctx = &self.ctx;
        if ctx.shared.atlas.read().keyframe(kf_id).is_none() {
            warn!("{} erased before semantic tracking", kf_id);
            return false;
        }

        let mut optimized = false;
        if kf_id.0 > ctx.config.warmup_keyframes {
            let start = Instant::now();
            match self.optimizer.optimize_pose(
                &ctx.shared,
                kf_id,
                ctx.config.weight_by_moving_probability,
            ) {
                Ok(report) => {
                    debug!(
                        "{}: semantic pose optimization, {} obs, {} dynamic rejected, error {:.3} -> {:.3}",
                        kf_id,
                        report.num_observations,
                        report.num_rejected_dynamic,
                        report.initial_error,
                        report.final_error
                    );
                    optimized = true;
                }
                Err(e) => warn!("{}: semantic pose optimization failed: {:#}", kf_id, e),
            }
            ctx.stats.record_semantic_optimization(start.elapsed());
        }

        if ctx.config.semantic_ba.enabled {
            ctx.ba_queue.push(kf_id);
        }
        optimized
    }
}
