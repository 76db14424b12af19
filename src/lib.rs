//! Real-time 3D tracking of multiple faces from 2D keypoint detections.
//!
//! Detections are lifted into world-space observations, associated with live
//! tracks by maximizing a joint probability, and filtered with constant-velocity
//! Kalman filters. Identity resolution runs off the frame loop.

pub mod error;
pub mod integration;
pub mod tracker;

pub use error::Error;
pub use integration::{DetectionBuilder, IdentityResolver, IdentityService, TrackerPipeline};
pub use tracker::{Detection, FaceTracker, Frame, FrameOutput, PinholeCamera, StaticTransforms, TrackerConfig};
