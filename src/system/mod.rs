//! Semantic system orchestration and thread management.
//!
//! This module contains the top-level `SemanticSystem` that spawns and
//! coordinates the segmentation, semantic tracking and semantic BA threads,
//! along with the shared map store and inter-thread messaging types.

pub mod messages;
pub mod semantic_system;
pub mod shared_state;

pub use messages::{WorkerEvent, WorkerKind};
pub use semantic_system::{LifecycleState, SemanticSystem};
pub use shared_state::SharedState;
