//! Error types surfaced at the public boundary of the semantic pipeline.
//!
//! Only configuration problems, an unavailable map and graph misuse such as a
//! duplicate keyframe propagate to callers.
//! Segmentation contract violations, optimizer failures and lifecycle misuse
//! are logged and recovered inside the workers.

use thiserror::Error;

use crate::atlas::map::KeyFrameId;

#[derive(Debug, Error)]
pub enum SemanticError {
    /// Missing or invalid configuration, fatal at startup.
    #[error("invalid semantic configuration: {0}")]
    Config(String),

    /// The segmentation service could not be created by its factory.
    #[error("segmentation service failed to start: {0}")]
    ServiceStart(String),

    /// The current map stayed invalid for the whole polling window.
    #[error("current map is unavailable")]
    MapUnavailable,

    #[error("keyframe {0} already exists")]
    DuplicateKeyFrame(KeyFrameId),
}

pub type SemanticResult<T> = std::result::Result<T, SemanticError>;
