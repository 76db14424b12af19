use serde::{Deserialize, Serialize};

/// Lifecycle state of a face track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackState {
    /// Spawned from an unclaimed observation, not yet mature
    #[default]
    Tentative,
    /// Matched to an observation this frame
    Tracked,
    /// In view but hidden behind a nearer face
    Occluded,
    /// Not detected, or outside the camera frame
    Undetected,
    /// Removed from tracking
    Pruned,
}
