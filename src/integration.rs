//! Glue between the tracker and the outside world.
//!
//! This module provides a keypoint detection builder, the identity service
//! seam, and a threaded pipeline that runs the tracker off the capture thread.

mod builder;
mod identity;
mod pipeline;

pub use builder::DetectionBuilder;
pub use identity::{Dispatch, Embedding, IdentityMatch, IdentityResolver, IdentityResult, IdentityService, Profile};
pub use pipeline::TrackerPipeline;
