//! A single face tracked across frames.

use std::collections::HashMap;
use std::f64::consts::{PI, TAU};

use log::{info, warn};
use nalgebra::{Isometry3, Matrix4, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::integration::{Embedding, IdentityMatch, Profile};
use crate::tracker::confidence::ConfidenceWindow;
use crate::tracker::face_tracker::TrackerConfig;
use crate::tracker::kalman_filter::Kalman3;
use crate::tracker::observation::{Observation, SaccadePoint};
use crate::tracker::track_state::TrackState;

/// Something downstream consumers may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackEvent {
    Entered { id: u64 },
    Exited { id: u64 },
    Speaking { id: u64, score: f64 },
    Pose { id: u64, name: String },
    IdentityResolved { id: u64, profile_id: String, display_name: String },
}

/// Immutable view of a mature track, published once per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: u64,
    pub position: Point3<f64>,
    /// Indexed by [`SaccadePoint`].
    pub landmark_points: Vec<Point3<f64>>,
    pub world_transform: Matrix4<f64>,
    pub timestamp: f64,
    pub resolved_name: Option<String>,
    pub caption: Option<String>,
}

/// Every filter a track owns, for persistence and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackFilterState {
    pub head: Kalman3,
    pub saccades: [Kalman3; SaccadePoint::COUNT],
}

#[derive(Debug, Clone)]
pub struct FaceTrack {
    pub id: u64,
    pub state: TrackState,
    head: Kalman3,
    saccades: [Kalman3; SaccadePoint::COUNT],
    yaw: f64,
    roll: f64,
    confidence: ConfidenceWindow,
    consecutive_hits: u32,
    created_at: f64,
    last_update: f64,
    camera_origin: Point3<f64>,
    entered: bool,
    exited: bool,
    identity: Option<Profile>,
    identity_pending: bool,
    identity_attempts: u32,
    last_identity_attempt: Option<f64>,
    embeddings: Vec<Embedding>,
    caption: Option<String>,
    last_speaking_event: Option<f64>,
    last_pose_events: HashMap<String, f64>,
}

impl FaceTrack {
    /// Seed a tentative track from an unclaimed observation.
    pub fn new(id: u64, obs: &Observation, config: &TrackerConfig) -> Self {
        let kalman = &config.kalman;
        let head_distance = (obs.head - obs.camera_origin).norm();
        let head = Kalman3::from_view(
            obs.head.coords,
            &obs.view_direction(),
            head_distance,
            kalman.initial_velocity_variance,
            kalman.head_q,
            kalman.noise,
            obs.timestamp,
        );
        let saccades = obs.saccades.map(|p| {
            let offset = p - obs.camera_origin;
            Kalman3::from_view(
                p.coords,
                &offset,
                offset.norm(),
                kalman.initial_velocity_variance,
                kalman.saccade_q,
                kalman.noise,
                obs.timestamp,
            )
        });

        let mut confidence = ConfidenceWindow::with_capacity(config.lifecycle.window_capacity);
        confidence.push(obs.confidence);

        Self {
            id,
            state: TrackState::Tentative,
            head,
            saccades,
            yaw: obs.yaw,
            roll: obs.roll,
            confidence,
            consecutive_hits: 1,
            created_at: obs.timestamp,
            last_update: obs.timestamp,
            camera_origin: obs.camera_origin,
            entered: false,
            exited: false,
            identity: None,
            identity_pending: false,
            identity_attempts: 0,
            last_identity_attempt: None,
            embeddings: Vec::new(),
            caption: None,
            last_speaking_event: None,
            last_pose_events: HashMap::new(),
        }
    }

    /// Mean of the confidence window.
    #[inline]
    pub fn confidence(&self) -> f64 {
        self.confidence.mean()
    }

    #[inline]
    pub fn confidence_window(&self) -> &ConfidenceWindow {
        &self.confidence
    }

    #[inline]
    pub fn position(&self) -> Point3<f64> {
        self.head.position()
    }

    #[inline]
    pub fn velocity(&self) -> Vector3<f64> {
        self.head.vel
    }

    pub fn saccade(&self, point: SaccadePoint) -> Point3<f64> {
        self.saccades[point as usize].position()
    }

    #[inline]
    pub fn yaw(&self) -> f64 {
        self.yaw
    }

    #[inline]
    pub fn roll(&self) -> f64 {
        self.roll
    }

    #[inline]
    pub fn camera_origin(&self) -> Point3<f64> {
        self.camera_origin
    }

    /// Whether the track has been announced with [`TrackEvent::Entered`].
    #[inline]
    pub fn is_mature(&self) -> bool {
        self.entered
    }

    #[inline]
    pub fn has_exited(&self) -> bool {
        self.exited
    }

    #[inline]
    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    #[inline]
    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    #[inline]
    pub fn last_update(&self) -> f64 {
        self.last_update
    }

    #[inline]
    pub fn time_since_update(&self, now: f64) -> f64 {
        now - self.last_update
    }

    #[inline]
    pub fn profile(&self) -> Option<&Profile> {
        self.identity.as_ref()
    }

    #[inline]
    pub fn profile_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|p| p.profile_id.as_str())
    }

    #[inline]
    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    #[inline]
    pub fn identity_pending(&self) -> bool {
        self.identity_pending
    }

    #[inline]
    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub fn set_caption(&mut self, caption: Option<String>) {
        self.caption = caption;
    }

    pub fn predict(&mut self, now: f64) {
        self.head.predict(now);
        for filter in self.saccades.iter_mut() {
            filter.predict(now);
        }
    }

    /// Fold a matched observation into the track, returning any notifications it raises.
    pub fn apply_observation(&mut self, obs: &Observation, config: &TrackerConfig) -> Vec<TrackEvent> {
        let mut events = Vec::new();

        let head_distance = (obs.head - obs.camera_origin).norm();
        if let Err(err) = self
            .head
            .update_from_view(&obs.head.coords, &obs.view_direction(), head_distance)
        {
            warn!("track {}: skipping head update: {err}", self.id);
        }
        for (filter, point) in self.saccades.iter_mut().zip(obs.saccades.iter()) {
            let offset = point - obs.camera_origin;
            if let Err(err) = filter.update_from_view(&point.coords, &offset, offset.norm()) {
                warn!("track {}: skipping landmark update: {err}", self.id);
            }
        }

        let alpha = config.lifecycle.orientation_smoothing;
        self.yaw = wrap_angle(self.yaw + alpha * wrap_angle(obs.yaw - self.yaw));
        self.roll = wrap_angle(self.roll + alpha * wrap_angle(obs.roll - self.roll));

        self.confidence.push(obs.confidence);
        self.consecutive_hits += 1;
        self.last_update = obs.timestamp;
        self.camera_origin = obs.camera_origin;

        if !self.entered && self.consecutive_hits >= config.lifecycle.min_hits {
            self.entered = true;
            info!("track {} entered", self.id);
            events.push(TrackEvent::Entered { id: self.id });
        }
        self.state = if self.entered {
            TrackState::Tracked
        } else {
            TrackState::Tentative
        };

        if self.entered {
            self.forward_metadata(obs, config, &mut events);
        }

        events
    }

    /// Announce a track without waiting for further matches.
    pub fn promote(&mut self) {
        if !self.entered {
            self.entered = true;
            self.state = TrackState::Tracked;
            info!("track {} entered", self.id);
        }
    }

    fn forward_metadata(&mut self, obs: &Observation, config: &TrackerConfig, events: &mut Vec<TrackEvent>) {
        let interval = config.lifecycle.event_interval;
        let now = obs.timestamp;
        let due = |last: Option<f64>| last.is_none_or(|t| now - t >= interval);

        if let Some(score) = obs.speaking_score {
            if score >= config.lifecycle.speaking_threshold && due(self.last_speaking_event) {
                self.last_speaking_event = Some(now);
                events.push(TrackEvent::Speaking { id: self.id, score });
            }
        }

        for name in &obs.pose_events {
            if due(self.last_pose_events.get(name).copied()) {
                self.last_pose_events.insert(name.clone(), now);
                events.push(TrackEvent::Pose {
                    id: self.id,
                    name: name.clone(),
                });
            }
        }
    }

    /// In view but unmatched: record a zero detection, keep the prediction.
    pub fn mark_missed(&mut self, state: TrackState) {
        self.confidence.push(0.0);
        self.consecutive_hits = 0;
        if self.entered {
            self.state = state;
        }
    }

    /// Outside the camera frame: slow the drift without spending a window slot.
    pub fn mark_out_of_frame(&mut self, damping: f64) {
        self.head.damp_velocity(damping);
        for filter in self.saccades.iter_mut() {
            filter.damp_velocity(damping);
        }
        self.consecutive_hits = 0;
        if self.entered {
            self.state = TrackState::Undetected;
        }
    }

    pub fn should_prune(&self, now: f64, config: &TrackerConfig) -> bool {
        self.confidence() < config.lifecycle.min_confidence
            || self.time_since_update(now) > config.lifecycle.timeout
    }

    /// Mark the track destroyed. Returns [`TrackEvent::Exited`] if it had been announced.
    pub fn mark_pruned(&mut self) -> Option<TrackEvent> {
        self.state = TrackState::Pruned;
        if self.entered && !self.exited {
            self.exited = true;
            info!("track {} exited", self.id);
            return Some(TrackEvent::Exited { id: self.id });
        }
        None
    }

    /// Whether a new identity request may be issued now.
    pub fn wants_identity(&self, now: f64, config: &TrackerConfig) -> bool {
        let identity = &config.identity;
        self.identity.is_none()
            && !self.identity_pending
            && self.identity_attempts < identity.max_attempts
            && self
                .last_identity_attempt
                .is_none_or(|t| now - t >= identity.retry_interval)
    }

    pub fn begin_identity_request(&mut self, now: f64) {
        self.identity_pending = true;
        self.identity_attempts += 1;
        self.last_identity_attempt = Some(now);
    }

    /// Apply the outcome of an identity request issued for this track.
    pub fn finish_identity_request(
        &mut self,
        outcome: Result<IdentityMatch, IdentityError>,
        max_samples: usize,
    ) -> Option<TrackEvent> {
        self.identity_pending = false;

        let matched = match outcome {
            Ok(matched) => matched,
            Err(err) => {
                warn!("track {}: identity request failed: {err}", self.id);
                return None;
            }
        };

        if self.embeddings.len() >= max_samples && !self.embeddings.is_empty() {
            self.embeddings.remove(0);
        }
        if max_samples > 0 {
            self.embeddings.push(matched.embedding);
        }

        let profile = matched.profile?;
        if self.identity.is_some() {
            return None;
        }
        info!("track {} resolved to profile {}", self.id, profile.profile_id);
        let event = TrackEvent::IdentityResolved {
            id: self.id,
            profile_id: profile.profile_id.clone(),
            display_name: profile.display_name.clone(),
        };
        self.identity = Some(profile);
        Some(event)
    }

    pub fn take_embeddings(&mut self) -> Vec<Embedding> {
        std::mem::take(&mut self.embeddings)
    }

    /// Head pose: facing the camera, turned by yaw, rolled about the facing axis.
    pub fn world_transform(&self) -> Matrix4<f64> {
        let pos = self.position();
        let to_camera = self.camera_origin - pos;
        let heading = to_camera.y.atan2(to_camera.x) + self.yaw;
        let rotation = UnitQuaternion::from_euler_angles(self.roll, 0.0, heading);
        Isometry3::from_parts(Translation3::from(pos.coords), rotation).to_homogeneous()
    }

    pub fn snapshot(&self, timestamp: f64) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            position: self.position(),
            landmark_points: self.saccades.iter().map(Kalman3::position).collect(),
            world_transform: self.world_transform(),
            timestamp,
            resolved_name: self.identity.as_ref().map(|p| p.display_name.clone()),
            caption: self.caption.clone(),
        }
    }

    pub fn filter_state(&self) -> TrackFilterState {
        TrackFilterState {
            head: self.head.clone(),
            saccades: self.saccades.clone(),
        }
    }

    pub fn restore_filter_state(&mut self, state: TrackFilterState) {
        self.head = state.head;
        self.saccades = state.saccades;
    }
}

/// Wrap an angle into [-pi, pi).
#[inline]
fn wrap_angle(angle: f64) -> f64 {
    (angle + PI).rem_euclid(TAU) - PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::camera::{FrameGeometry, PinholeCamera, StaticTransforms, forward_camera_pose};
    use crate::tracker::observation::ObservationBuilder;
    use crate::tracker::observation::tests::synthetic_detection;

    fn observation(head: Point3<f64>, t: f64) -> Observation {
        let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        let tf = StaticTransforms::new().with("camera", "world", forward_camera_pose(Point3::new(0.0, 0.0, 1.2), 0.0));
        let geometry = FrameGeometry::new(&camera, &tf, "camera", "world", t);
        let det = synthetic_detection(&camera, &tf, head, 0.0, 0.9);
        ObservationBuilder::default().build(0, &det, &geometry, t).unwrap()
    }

    #[test]
    fn test_track_matures_after_min_hits() {
        let config = TrackerConfig::default();
        let head = Point3::new(2.0, 0.0, 1.2);
        let mut track = FaceTrack::new(1, &observation(head, 0.0), &config);
        assert_eq!(track.state, TrackState::Tentative);
        assert!(!track.is_mature());

        let mut entered = 0;
        for i in 1..config.lifecycle.min_hits {
            let t = i as f64 / 30.0;
            track.predict(t);
            let events = track.apply_observation(&observation(head, t), &config);
            entered += events.iter().filter(|e| matches!(e, TrackEvent::Entered { .. })).count();
        }
        assert_eq!(entered, 1);
        assert!(track.is_mature());
        assert_eq!(track.state, TrackState::Tracked);
        assert!((track.position() - head).norm() < 0.05);
    }

    #[test]
    fn test_missed_frames_decay_confidence() {
        let config = TrackerConfig::default();
        let mut track = FaceTrack::new(1, &observation(Point3::new(2.0, 0.0, 1.2), 0.0), &config);
        let before = track.confidence();
        track.mark_missed(TrackState::Undetected);
        assert!(track.confidence() < before);
        assert_eq!(track.consecutive_hits(), 0);
        // tentative tracks stay tentative until they mature
        assert_eq!(track.state, TrackState::Tentative);
    }

    #[test]
    fn test_out_of_frame_damps_velocity_without_window_slot() {
        let config = TrackerConfig::default();
        let mut track = FaceTrack::new(1, &observation(Point3::new(2.0, 0.0, 1.2), 0.0), &config);
        track.head.vel = Vector3::new(1.0, 0.0, 0.0);
        let samples = track.confidence_window().len();
        track.mark_out_of_frame(0.5);
        assert_eq!(track.velocity(), Vector3::new(0.5, 0.0, 0.0));
        assert_eq!(track.confidence_window().len(), samples);
    }

    #[test]
    fn test_identity_result_sets_profile_once() {
        let config = TrackerConfig::default();
        let mut track = FaceTrack::new(1, &observation(Point3::new(2.0, 0.0, 1.2), 0.0), &config);
        assert!(track.wants_identity(0.0, &config));
        track.begin_identity_request(0.0);
        assert!(!track.wants_identity(5.0, &config));

        let event = track.finish_identity_request(
            Ok(IdentityMatch {
                embedding: Embedding(vec![0.5]),
                profile: Some(Profile {
                    profile_id: "p1".into(),
                    display_name: "Ada".into(),
                }),
            }),
            config.identity.max_samples,
        );
        assert!(matches!(event, Some(TrackEvent::IdentityResolved { .. })));
        assert_eq!(track.profile_id(), Some("p1"));
        assert_eq!(track.embeddings().len(), 1);
        assert_eq!(track.snapshot(0.0).resolved_name.as_deref(), Some("Ada"));
        assert!(!track.wants_identity(10.0, &config));
    }

    #[test]
    fn test_identity_retry_budget() {
        let config = TrackerConfig::default();
        let mut track = FaceTrack::new(1, &observation(Point3::new(2.0, 0.0, 1.2), 0.0), &config);
        let mut t = 0.0;
        for _ in 0..config.identity.max_attempts {
            assert!(track.wants_identity(t, &config));
            track.begin_identity_request(t);
            track.finish_identity_request(Err(IdentityError::Lookup("down".into())), 4);
            t += config.identity.retry_interval;
        }
        assert!(!track.wants_identity(t + 100.0, &config));
    }

    #[test]
    fn test_embedding_samples_are_bounded() {
        let config = TrackerConfig::default();
        let mut track = FaceTrack::new(1, &observation(Point3::new(2.0, 0.0, 1.2), 0.0), &config);
        for i in 0..5 {
            track.finish_identity_request(
                Ok(IdentityMatch {
                    embedding: Embedding(vec![i as f32]),
                    profile: None,
                }),
                3,
            );
        }
        let kept: Vec<f32> = track.embeddings().iter().map(|e| e.0[0]).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_world_transform_faces_camera() {
        let config = TrackerConfig::default();
        let head = Point3::new(2.0, 0.0, 1.2);
        let track = FaceTrack::new(1, &observation(head, 0.0), &config);
        let m = track.world_transform();
        // local x is the facing direction, which points back at the camera (world -x)
        let facing = Vector3::new(m[(0, 0)], m[(1, 0)], m[(2, 0)]);
        assert!(facing.x < -0.95, "facing {facing:?}");
        assert!((m[(0, 3)] - track.position().x).abs() < 1e-12);
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * PI).abs() - PI).abs() < 1e-9);
        assert!((wrap_angle(0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_angle(-0.5 - TAU) + 0.5).abs() < 1e-12);
    }
}
