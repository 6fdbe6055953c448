//! Semantic System - entry point and thread orchestration.
//!
//! The `SemanticSystem` is the top-level struct the SLAM front-end interacts
//! with. It owns the semantic context and spawns the segmentation, semantic
//! tracking and (optionally) semantic BA threads.
//!
//! Lifecycle: `Created → Running → FinishRequested → Stopped`. Every
//! transition is driven by the caller; misuse (starting twice, finishing
//! twice) is logged and ignored.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::atlas::map::{KeyFrameId, MapPoint, MapPointId};
use crate::error::{SemanticError, SemanticResult};
use crate::optimizer::PoseOptimizer;
use crate::semantic::config::{DynamicClasses, SegmentationScheme, SemanticConfig};
use crate::semantic::context::SemanticContext;
use crate::semantic::diagnostics::{DiagnosticSink, DirectorySink, NoopSink};
use crate::semantic::mask::MaskGenerator;
use crate::semantic::probability::policy_from_config;
use crate::semantic::segmentation_worker::SegmentationWorker;
use crate::semantic::segmenter::ServiceFactory;
use crate::semantic::semantic_ba::SemanticBundleAdjuster;
use crate::semantic::semantic_tracker::SemanticTracker;
use crate::semantic::stats::SemanticStats;

use super::messages::{WorkerEvent, WorkerKind};
use super::shared_state::SharedState;

/// Lifecycle state of the semantic pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    FinishRequested,
    Stopped,
}

/// Main semantic system orchestrating the worker threads.
pub struct SemanticSystem {
    /// Context shared with every worker.
    ctx: Arc<SemanticContext>,

    /// Pose refinement collaborator.
    optimizer: Arc<dyn PoseOptimizer>,

    /// Diagnostic image sink handed to the mask generator.
    sink: Arc<dyn DiagnosticSink>,

    /// Consumed by `start()`.
    factory: Mutex<Option<ServiceFactory>>,

    state: Mutex<LifecycleState>,

    /// Signaled once the state reaches `Stopped`.
    stopped: Condvar,

    // ─────────────────────────────────────────────────────────────────────
    // Worker plumbing
    // ─────────────────────────────────────────────────────────────────────
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,

    /// Handles of the running workers. Taken (emptied) when joined.
    handles: Mutex<Vec<(WorkerKind, JoinHandle<()>)>>,
}

impl SemanticSystem {
    /// Create the system. Fails on an invalid configuration, or when the
    /// optimizer classifies points with a threshold other than
    /// `dynamic_threshold`.
    ///
    /// No thread is spawned until [`SemanticSystem::start`].
    pub fn new(
        config: SemanticConfig,
        shared: Arc<SharedState>,
        factory: ServiceFactory,
        optimizer: Arc<dyn PoseOptimizer>,
    ) -> SemanticResult<Self> {
        config.validate()?;
        let classes = config.dynamic_classes()?;
        if let Some(threshold) = optimizer.dynamic_threshold() {
            if (threshold - config.dynamic_threshold).abs() > f32::EPSILON {
                return Err(SemanticError::Config(format!(
                    "pose optimizer threshold {} differs from dynamic_threshold {}",
                    threshold, config.dynamic_threshold
                )));
            }
        }

        let sink: Arc<dyn DiagnosticSink> = match &config.diagnostics_dir {
            Some(dir) => Arc::new(DirectorySink::new(dir.clone()).map_err(|e| {
                SemanticError::Config(format!("diagnostics dir {:?}: {:#}", dir, e))
            })?),
            None => Arc::new(NoopSink),
        };

        info!(
            "Semantic system created: scheme {}, batch size {}, threshold {}",
            config.scheme, config.batch_size, config.dynamic_threshold
        );

        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            ctx: Arc::new(SemanticContext::new(config, classes, shared)),
            optimizer,
            sink,
            factory: Mutex::new(Some(factory)),
            state: Mutex::new(LifecycleState::Created),
            stopped: Condvar::new(),
            events_tx,
            events_rx,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn config(&self) -> &SemanticConfig {
        &self.ctx.config
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.ctx.shared
    }

    pub fn context(&self) -> &Arc<SemanticContext> {
        &self.ctx
    }

    pub fn stats(&self) -> &SemanticStats {
        &self.ctx.stats
    }

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    /// Turn segmentation dispatch on or off. Queued keyframes are kept.
    pub fn enable(&self, enabled: bool) {
        info!("Semantic segmentation {}", if enabled { "enabled" } else { "disabled" });
        self.ctx.requests.set_enabled(enabled);
    }

    /// Select the dynamic class table by segmentation method name
    /// (`maskrcnn`, `segnet` or `custom`).
    ///
    /// Only honored before `start()`; later calls are logged and ignored.
    pub fn set_dynamic_class_mapping(&self, method_name: &str) -> SemanticResult<()> {
        let scheme: SegmentationScheme = method_name.parse()?;
        let config = SemanticConfig {
            scheme,
            ..self.ctx.config.clone()
        };
        let classes: DynamicClasses = config.dynamic_classes()?;

        let state = self.state.lock();
        if *state != LifecycleState::Created {
            warn!("Dynamic class mapping cannot change while {:?}, ignored", *state);
            return Ok(());
        }
        info!(
            "Dynamic classes for {}: {:?}",
            scheme,
            classes.iter().collect::<Vec<_>>()
        );
        *self.ctx.classes.write() = classes;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Front-end boundary
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a keyframe for segmentation.
    ///
    /// Returns false if the keyframe does not exist, is already queued, or
    /// the system has stopped.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) -> bool {
        if matches!(self.state(), LifecycleState::FinishRequested | LifecycleState::Stopped) {
            warn!("{} inserted after finish was requested, ignored", kf_id);
            return false;
        }

        {
            let mut atlas = self.ctx.shared.atlas.write();
            let Some(kf) = atlas.keyframe_mut(kf_id) else {
                warn!("Cannot queue unknown {}", kf_id);
                return false;
            };
            if kf.in_semantic_queue {
                debug!("{} already queued for segmentation", kf_id);
                return false;
            }
            kf.in_semantic_queue = true;
        }

        self.ctx.requests.enqueue(kf_id);
        true
    }

    /// Unknown points are dynamic; at the threshold a point is static.
    pub fn is_dynamic(&self, point: Option<&MapPoint>) -> bool {
        self.ctx.classifier.is_dynamic(point)
    }

    /// [`SemanticSystem::is_dynamic`] by handle.
    pub fn is_dynamic_point(&self, mp_id: MapPointId) -> bool {
        let atlas = self.ctx.shared.atlas.read();
        self.ctx.classifier.is_dynamic(atlas.map_point(mp_id))
    }

    /// Highest keyframe id labeled so far.
    pub fn latest_labeled_keyframe_id(&self) -> Option<KeyFrameId> {
        self.ctx.latest_labeled()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Spawn the workers.
    ///
    /// Blocks until the dispatcher has created its segmentation service; a
    /// factory failure stops the system and is returned as
    /// [`SemanticError::ServiceStart`]. Calling it in any state other than
    /// `Created` is a logged no-op.
    pub fn start(&self) -> SemanticResult<()> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Created {
            warn!("start() called while {:?}, ignored", *state);
            return Ok(());
        }
        let Some(factory) = self.factory.lock().take() else {
            return Err(SemanticError::ServiceStart(
                "segmentation service factory already consumed".to_string(),
            ));
        };

        let classes = self.ctx.classes.read().clone();
        let masks = MaskGenerator::new(
            &classes,
            self.ctx.config.dilate,
            self.ctx.config.dilation_radius,
            Arc::clone(&self.sink),
        );
        let policy = policy_from_config(&self.ctx.config.probability_update);

        let mut worker = SegmentationWorker::new(Arc::clone(&self.ctx), masks, policy);
        let events = self.events_tx.clone();
        let handle = thread::Builder::new()
            .name("semantic-segmentation".to_string())
            .spawn(move || worker.run(factory, events))
            .map_err(|e| SemanticError::ServiceStart(format!("spawn failed: {}", e)))?;

        match self.wait_for_service() {
            Ok(()) => {}
            Err(e) => {
                let _ = handle.join();
                self.drain_events();
                *state = LifecycleState::Stopped;
                self.stopped.notify_all();
                return Err(e);
            }
        }

        let mut handles = self.handles.lock();
        handles.push((WorkerKind::Segmentation, handle));

        let tracker = SemanticTracker::new(Arc::clone(&self.ctx), Arc::clone(&self.optimizer));
        let events = self.events_tx.clone();
        match thread::Builder::new()
            .name("semantic-tracking".to_string())
            .spawn(move || tracker.run(events))
        {
            Ok(handle) => handles.push((WorkerKind::Tracking, handle)),
            Err(e) => error!("Failed to spawn semantic tracking thread: {}", e),
        }

        if self.ctx.config.semantic_ba.enabled {
            let ba = SemanticBundleAdjuster::new(Arc::clone(&self.ctx), Arc::clone(&self.optimizer));
            let events = self.events_tx.clone();
            match thread::Builder::new()
                .name("semantic-ba".to_string())
                .spawn(move || ba.run(events))
            {
                Ok(handle) => handles.push((WorkerKind::SemanticBA, handle)),
                Err(e) => error!("Failed to spawn semantic BA thread: {}", e),
            }
        }

        *state = LifecycleState::Running;
        info!("Semantic system running with {} workers", handles.len());
        Ok(())
    }

    /// Wait for the dispatcher's service report.
    fn wait_for_service(&self) -> SemanticResult<()> {
        loop {
            match self.events_rx.recv() {
                Ok(WorkerEvent::ServiceReady) => return Ok(()),
                Ok(WorkerEvent::ServiceFailed(reason)) => {
                    return Err(SemanticError::ServiceStart(reason))
                }
                Ok(other) => debug!("Ignoring {:?} while waiting for the service", other),
                Err(_) => {
                    return Err(SemanticError::ServiceStart(
                        "segmentation worker exited before reporting".to_string(),
                    ))
                }
            }
        }
    }

    fn drain_events(&self) {
        while self.events_rx.try_recv().is_ok() {}
    }

    /// Ask every worker to finish, wait for them to go quiescent, and join
    /// them. Safe to call any number of times, from any thread: every call
    /// returns only once all workers are joined.
    pub fn request_finish(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Created => {
                    info!("Semantic system finished before start");
                    *state = LifecycleState::Stopped;
                    self.stopped.notify_all();
                    return;
                }
                LifecycleState::Running => *state = LifecycleState::FinishRequested,
                LifecycleState::FinishRequested => {
                    debug!("Finish already in progress, waiting for the workers");
                    while *state != LifecycleState::Stopped {
                        self.stopped.wait(&mut state);
                    }
                    return;
                }
                LifecycleState::Stopped => {
                    debug!("Finish already requested");
                    return;
                }
            }
        }

        info!("Semantic system finishing");
        self.ctx.request_finish();

        let mut handles = std::mem::take(&mut *self.handles.lock());

        // Wait for quiescence reports
        let deadline = Instant::now() + self.ctx.config.finish_timeout();
        let mut pending = handles.len();
        while pending > 0 {
            match self.events_rx.recv_deadline(deadline) {
                Ok(WorkerEvent::Stopped(kind)) => {
                    debug!("{} worker quiescent", kind);
                    pending -= 1;
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "{} workers still busy after {:?}, joining anyway",
                        pending,
                        self.ctx.config.finish_timeout()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for (kind, handle) in handles.drain(..) {
            if handle.join().is_err() {
                error!("{} worker panicked", kind);
            }
        }
        self.drain_events();

        *self.state.lock() = LifecycleState::Stopped;
        self.stopped.notify_all();
        let summary = self.ctx.stats.summary();
        info!(
            "Semantic system stopped: {} segmented, {} re-routed, {} failed",
            summary.segmented, summary.rerouted, summary.failed
        );
    }
}

impl Drop for SemanticSystem {
    fn drop(&mut self) {
        self.request_finish();
    }
}
