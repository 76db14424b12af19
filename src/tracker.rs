mod camera;
mod confidence;
mod face_track;
mod face_tracker;
mod kalman_filter;
mod matching;
mod observation;
mod track_state;

pub use camera::{FrameConverter, FrameGeometry, PinholeCamera, Ray, StaticTransforms, forward_camera_pose};
pub use confidence::ConfidenceWindow;
pub use face_track::{FaceTrack, TrackEvent, TrackFilterState, TrackSnapshot};
pub use face_tracker::{
    FaceTracker, Frame, FrameOutput, Health, HealthReport, IdentityConfig, KalmanConfig, LifecycleConfig,
    TrackerConfig,
};
pub use kalman_filter::{Kalman3, MeasurementNoise, ScalarKalman, pos_cov_matrix};
pub use matching::{Association, AssociationConfig, Associator, Visibility};
pub use observation::{
    Detection, FaceGeometry, FaceKeypoint, ImageCrop, Observation, ObservationBuilder, SaccadePoint, TurnDirection,
};
pub use track_state::TrackState;
