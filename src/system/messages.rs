//! Inter-thread message types.
//!
//! Workers report lifecycle events to the `SemanticSystem` over a crossbeam
//! channel: the dispatcher announces whether its segmentation service came
//! up, and every worker announces when it has gone quiescent.

use std::fmt;

/// The long-lived worker threads of the semantic pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Segmentation,
    Tracking,
    SemanticBA,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerKind::Segmentation => "segmentation",
            WorkerKind::Tracking => "semantic tracking",
            WorkerKind::SemanticBA => "semantic BA",
        };
        f.write_str(name)
    }
}

/// Message sent from a worker to the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The segmentation service was created on the dispatcher thread.
    ServiceReady,
    /// The service factory failed; the dispatcher exits right after.
    ServiceFailed(String),
    /// The worker left its loop and holds no more work.
    Stopped(WorkerKind),
}
