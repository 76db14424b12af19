//! Error types for observation building, filtering, identity lookups and configuration.

use thiserror::Error;

use crate::tracker::FaceKeypoint;

/// A single detection could not be turned into an observation.
///
/// These never abort a frame: the detection is dropped and the frame continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("no transform from `{from}` to `{to}` at the requested time")]
    MissingTransform { from: String, to: String },
    #[error("keypoint {index} is not a finite pixel coordinate")]
    MalformedKeypoint { index: usize },
    #[error("keypoint {0:?} is missing")]
    MissingKeypoint(FaceKeypoint),
    #[error("detection confidence must lie in [0, 1]")]
    InvalidConfidence,
    #[error("degenerate face geometry: {0}")]
    Degenerate(&'static str),
}

/// A Kalman update could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("innovation covariance is singular")]
    SingularCovariance,
}

/// Failure reported by the external identity service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("embedding computation failed: {0}")]
    Embedding(String),
    #[error("profile lookup failed: {0}")]
    Lookup(String),
    #[error("sample submission failed: {0}")]
    Submit(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Observation(#[from] ObservationError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}
