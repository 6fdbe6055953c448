//! Semantic dynamic-object pipeline.
//!
//! Keyframes flow through three queues:
//!
//! ```text
//! insert_keyframe ─► SegmentationRequestQueue ─► SegmentationWorker ─┐
//!                                                                    │ label, masks,
//!                                                                    │ moving probability
//!               SemanticBundleAdjuster ◄─ ba_queue ◄─ SemanticTracker ◄─ tracking_queue
//! ```
//!
//! The lifecycle of the workers is owned by `system::SemanticSystem`.

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod mask;
pub mod probability;
pub mod queue;
pub mod segmentation_worker;
pub mod segmenter;
pub mod semantic_ba;
pub mod semantic_tracker;
pub mod stats;

pub use config::{DynamicClasses, SegmentationScheme, SemanticConfig};
pub use context::SemanticContext;
pub use diagnostics::{DiagnosticSink, DirectorySink, NoopSink};
pub use mask::{MaskGenerator, SemanticMasks};
pub use probability::{DynamicClassifier, MovingProbabilityPolicy};
pub use queue::{KeyFrameChannel, SegmentationRequestQueue};
pub use segmentation_worker::SegmentationWorker;
pub use segmenter::{factory_from, SegmentationService, ServiceFactory};
pub use semantic_ba::SemanticBundleAdjuster;
pub use semantic_tracker::SemanticTracker;
pub use stats::{SemanticStats, SemanticStatsSummary};
