use std::sync::Arc;
use tracing::{info, warn, error, debug};
use crate::models::*;

pub mod prediction;
pub mod detector;
pub mod scheduler;

pub use prediction::PredictionEngine;
pub use detector::ConflictDetector;
pub use scheduler::DetectionScheduler;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pub/sub error: {0}")]
    PubSub(String),

    #[error("Hub error: {0}")]
    Hub(String),
}
