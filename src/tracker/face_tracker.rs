//! Per-frame orchestration of the face tracks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::integration::IdentityResolver;
use crate::tracker::camera::{FrameConverter, FrameGeometry, PinholeCamera};
use crate::tracker::face_track::{FaceTrack, TrackEvent, TrackSnapshot};
use crate::tracker::kalman_filter::MeasurementNoise;
use crate::tracker::matching::{AssociationConfig, Associator, Visibility};
use crate::tracker::observation::{Detection, FaceGeometry, Observation, ObservationBuilder};
use crate::tracker::track_state::TrackState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Acceleration variance of the head filter.
    pub head_q: f64,
    /// Acceleration variance of the landmark filters.
    pub saccade_q: f64,
    pub noise: MeasurementNoise,
    pub initial_velocity_variance: f64,
    /// Per-frame velocity multiplier while a track is outside the camera frame.
    pub out_of_frame_damping: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            head_q: 1.0,
            saccade_q: 2.0,
            noise: MeasurementNoise::default(),
            initial_velocity_variance: 0.25,
            out_of_frame_damping: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub window_capacity: usize,
    /// Consecutive matches before a track is announced.
    pub min_hits: u32,
    /// Tracks below this confidence are pruned.
    pub min_confidence: f64,
    /// Seconds without a match before a track is pruned.
    pub timeout: f64,
    /// Unclaimed observations below this confidence do not spawn tracks.
    pub spawn_confidence: f64,
    /// Blend factor for yaw and roll.
    pub orientation_smoothing: f64,
    /// Minimum seconds between repeats of the same event on one track.
    pub event_interval: f64,
    pub speaking_threshold: f64,
    /// Processing time allowed per frame, in seconds. Infinite disables overrun reporting.
    pub frame_budget: f64,
    /// Consecutive overruns before health reports degraded.
    pub degraded_after: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            window_capacity: 10,
            min_hits: 3,
            min_confidence: 0.2,
            timeout: 2.0,
            spawn_confidence: 0.5,
            orientation_smoothing: 0.3,
            event_interval: 1.0,
            speaking_threshold: 0.5,
            frame_budget: 0.033,
            degraded_after: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Identity requests allowed per track.
    pub max_attempts: u32,
    /// Seconds between requests for the same track.
    pub retry_interval: f64,
    /// Embedding samples kept per track.
    pub max_samples: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: 1.0,
            max_samples: 10,
        }
    }
}

/// Configuration for the [`FaceTracker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Frame all track state is expressed in.
    pub world_frame: String,
    pub kalman: KalmanConfig,
    pub geometry: FaceGeometry,
    pub association: AssociationConfig,
    pub lifecycle: LifecycleConfig,
    pub identity: IdentityConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            world_frame: "world".to_string(),
            kalman: KalmanConfig::default(),
            geometry: FaceGeometry::default(),
            association: AssociationConfig::default(),
            lifecycle: LifecycleConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: TrackerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.world_frame.is_empty() {
            return invalid("world_frame must not be empty");
        }
        if self.lifecycle.window_capacity == 0 {
            return invalid("lifecycle.window_capacity must be positive");
        }
        if self.lifecycle.timeout <= 0.0 {
            return invalid("lifecycle.timeout must be positive");
        }
        if !(0.0..1.0).contains(&self.lifecycle.min_confidence) {
            return invalid("lifecycle.min_confidence must lie in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.lifecycle.orientation_smoothing) {
            return invalid("lifecycle.orientation_smoothing must lie in [0, 1]");
        }
        let a = &self.association;
        if a.new_track_probability <= 0.0 || a.new_track_probability > 1.0 {
            return invalid("association.new_track_probability must lie in (0, 1]");
        }
        if !(0.0..1.0).contains(&a.max_visibility) {
            return invalid("association.max_visibility must lie in [0, 1)");
        }
        if a.gating_distance <= 0.0 || a.proximity_sigma <= 0.0 || a.edge_margin <= 0.0 {
            return invalid("association distances must be positive");
        }
        if !(0.0..=1.0).contains(&self.kalman.out_of_frame_damping) {
            return invalid("kalman.out_of_frame_damping must lie in [0, 1]");
        }
        if self.lifecycle.frame_budget.is_nan() || self.lifecycle.frame_budget < 0.0 {
            return invalid("lifecycle.frame_budget must be non-negative");
        }
        if self.geometry.eye_mouth_distance <= 0.0 || self.geometry.face_on_eye_ratio <= 0.0 {
            return invalid("face geometry must be positive");
        }
        Ok(())
    }
}

/// One camera frame of detections.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture time in seconds.
    pub timestamp: f64,
    pub camera_frame_id: String,
    pub camera: PinholeCamera,
    pub detections: Vec<Detection>,
}

impl Frame {
    pub fn new(timestamp: f64, camera_frame_id: &str, camera: PinholeCamera, detections: Vec<Detection>) -> Self {
        Self {
            timestamp,
            camera_frame_id: camera_frame_id.to_string(),
            camera,
            detections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Health {
    Healthy,
    /// This frame took longer than its budget.
    Overrun,
    /// Several consecutive frames overran.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReport {
    pub status: Health,
    pub processing_time: Duration,
    pub consecutive_overruns: u32,
}

/// Everything published for one frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub timestamp: f64,
    /// Mature tracks, ordered by id.
    pub tracks: Vec<TrackSnapshot>,
    pub events: Vec<TrackEvent>,
    pub health: HealthReport,
    pub dropped_observations: usize,
}

/// Owns every live face track and advances them one frame at a time.
pub struct FaceTracker {
    tracks: Vec<FaceTrack>,
    next_id: u64,
    frame_count: u64,
    consecutive_overruns: u32,
    config: TrackerConfig,
    builder: ObservationBuilder,
    identity: Option<IdentityResolver>,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let builder = ObservationBuilder::new(config.geometry);
        Self {
            tracks: Vec::new(),
            next_id: 1,
            frame_count: 0,
            consecutive_overruns: 0,
            config,
            builder,
            identity: None,
        }
    }

    pub fn with_identity(mut self, resolver: IdentityResolver) -> Self {
        self.identity = Some(resolver);
        self
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Every live track, mature or not.
    #[inline]
    pub fn tracks(&self) -> &[FaceTrack] {
        &self.tracks
    }

    pub fn track(&self, id: u64) -> Option<&FaceTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn identity(&self) -> Option<&IdentityResolver> {
        self.identity.as_ref()
    }

    /// Attach a caption to a track. Returns false if the track is gone.
    pub fn set_caption(&mut self, id: u64, caption: Option<String>) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(track) => {
                track.set_caption(caption);
                true
            }
            None => false,
        }
    }

    fn next_track_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Process one frame and publish the surviving mature tracks.
    pub fn update(&mut self, frame: &Frame, converter: &dyn FrameConverter) -> FrameOutput {
        let started = Instant::now();
        self.frame_count += 1;
        let now = frame.timestamp;
        let mut events = Vec::new();

        // Step 0: apply identity results that arrived since the last frame
        self.apply_identity_results(&mut events);

        let geometry = FrameGeometry::new(
            &frame.camera,
            converter,
            &frame.camera_frame_id,
            &self.config.world_frame,
            now,
        );

        // Step 1: lift detections into the world frame
        let mut observations = Vec::with_capacity(frame.detections.len());
        let mut dropped = 0;
        for (idx, det) in frame.detections.iter().enumerate() {
            match self.builder.build(idx, det, &geometry, now) {
                Ok(obs) => observations.push(obs),
                Err(err) => {
                    warn!("dropping detection {idx} at t={now:.3}: {err}");
                    dropped += 1;
                }
            }
        }

        // Step 2: predict every track to the frame time
        for track in self.tracks.iter_mut() {
            track.predict(now);
        }

        // Step 3: associate
        let association = Associator::new(&self.config.association, self.config.geometry.face_radius)
            .associate(&self.tracks, &observations, &geometry);
        debug!(
            "frame {}: {} tracks, {} observations, {} out of frame, score {:.4}",
            self.frame_count,
            self.tracks.len(),
            observations.len(),
            association.out_of_frame.len(),
            association.score
        );

        // Step 4: matched and unmatched in-frame tracks
        for &(idx, matched) in &association.assignments {
            match matched {
                Some(obs_idx) => {
                    let obs = &observations[obs_idx];
                    let track = &mut self.tracks[idx];
                    events.extend(track.apply_observation(obs, &self.config));
                    Self::maybe_request_identity(self.identity.as_ref(), track, obs, &self.config);
                }
                None => {
                    let state = match association.visibility[idx] {
                        Visibility::Occluded { .. } => TrackState::Occluded,
                        _ => TrackState::Undetected,
                    };
                    self.tracks[idx].mark_missed(state);
                }
            }
        }

        // Step 5: out-of-frame tracks drift to a halt
        for &idx in &association.out_of_frame {
            self.tracks[idx].mark_out_of_frame(self.config.kalman.out_of_frame_damping);
        }

        // Step 6: spawn from unclaimed observations
        for &obs_idx in &association.unclaimed {
            let obs = &observations[obs_idx];
            if obs.confidence < self.config.lifecycle.spawn_confidence {
                continue;
            }
            let id = self.next_track_id();
            debug!("spawning track {id} at {:?}", obs.head);
            let mut track = FaceTrack::new(id, obs, &self.config);
            events.extend(Self::mature_on_spawn(&mut track, &self.config));
            Self::maybe_request_identity(self.identity.as_ref(), &mut track, obs, &self.config);
            self.tracks.push(track);
        }

        // Step 7 and 8: merge, then prune
        self.merge_tracks(&mut events);
        self.prune_tracks(now, &mut events);

        // Step 9: publish
        let mut tracks: Vec<TrackSnapshot> = self
            .tracks
            .iter()
            .filter(|t| t.is_mature())
            .map(|t| t.snapshot(now))
            .collect();
        tracks.sort_by_key(|s| s.id);

        let health = self.health(started.elapsed());

        FrameOutput {
            timestamp: now,
            tracks,
            events,
            health,
            dropped_observations: dropped,
        }
    }

    /// A track spawned under `min_hits == 1` is mature immediately.
    fn mature_on_spawn(track: &mut FaceTrack, config: &TrackerConfig) -> Option<TrackEvent> {
        if config.lifecycle.min_hits > 1 {
            return None;
        }
        track.promote();
        Some(TrackEvent::Entered { id: track.id })
    }

    fn maybe_request_identity(
        resolver: Option<&IdentityResolver>,
        track: &mut FaceTrack,
        obs: &Observation,
        config: &TrackerConfig,
    ) {
        let (Some(resolver), Some(crop)) = (resolver, obs.crop.as_ref()) else {
            return;
        };
        if !track.wants_identity(obs.timestamp, config) {
            return;
        }
        track.begin_identity_request(obs.timestamp);
        resolver.request(track.id, crop.clone());
    }

    fn apply_identity_results(&mut self, events: &mut Vec<TrackEvent>) {
        let Some(resolver) = self.identity.as_ref() else {
            return;
        };
        let max_samples = self.config.identity.max_samples;
        for result in resolver.drain() {
            match self.tracks.iter_mut().find(|t| t.id == result.track_id) {
                Some(track) => events.extend(track.finish_identity_request(result.outcome, max_samples)),
                None => debug!("discarding identity result for pruned track {}", result.track_id),
            }
        }
    }

    /// Collapse tracks that resolved to the same profile, keeping the most confident.
    /// Returns how many tracks were removed.
    pub fn merge_tracks(&mut self, events: &mut Vec<TrackEvent>) -> usize {
        let mut keep: HashMap<String, usize> = HashMap::new();
        let mut doomed = vec![false; self.tracks.len()];

        for (idx, track) in self.tracks.iter().enumerate() {
            let Some(profile_id) = track.profile_id() else {
                continue;
            };
            match keep.get(profile_id).copied() {
                None => {
                    keep.insert(profile_id.to_string(), idx);
                }
                Some(other) => {
                    let (winner, loser) = if track.confidence() > self.tracks[other].confidence() {
                        (idx, other)
                    } else {
                        (other, idx)
                    };
                    doomed[loser] = true;
                    keep.insert(profile_id.to_string(), winner);
                }
            }
        }

        let mut removed = 0;
        let mut idx = 0;
        self.tracks.retain_mut(|track| {
            let drop = doomed[idx];
            idx += 1;
            if drop {
                info!("merging track {} into its profile twin", track.id);
                events.extend(track.mark_pruned());
                removed += 1;
            }
            !drop
        });
        removed
    }

    /// Destroy tracks that lost confidence or timed out. Returns how many were removed.
    pub fn prune_tracks(&mut self, now: f64, events: &mut Vec<TrackEvent>) -> usize {
        let config = &self.config;
        let identity = self.identity.as_ref();
        let mut removed = 0;

        self.tracks.retain_mut(|track| {
            if !track.should_prune(now, config) {
                return true;
            }
            debug!(
                "pruning track {} (confidence {:.3}, idle {:.2}s)",
                track.id,
                track.confidence(),
                track.time_since_update(now)
            );
            events.extend(track.mark_pruned());
            if track.profile().is_none() && !track.embeddings().is_empty() {
                if let Some(resolver) = identity {
                    resolver.submit_samples(track.id, track.take_embeddings());
                }
            }
            removed += 1;
            false
        });
        removed
    }

    fn health(&mut self, elapsed: Duration) -> HealthReport {
        let budget =
            Duration::try_from_secs_f64(self.config.lifecycle.frame_budget.max(0.0)).unwrap_or(Duration::MAX);
        let status = if elapsed > budget {
            self.consecutive_overruns += 1;
            warn!(
                "frame {} took {:?}, over its {:?} budget",
                self.frame_count, elapsed, budget
            );
            if self.consecutive_overruns >= self.config.lifecycle.degraded_after {
                Health::Degraded
            } else {
                Health::Overrun
            }
        } else {
            self.consecutive_overruns = 0;
            Health::Healthy
        };
        HealthReport {
            status,
            processing_time: elapsed,
            consecutive_overruns: self.consecutive_overruns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = TrackerConfig::from_json(r#"{ "lifecycle": { "min_hits": 5 } }"#).unwrap();
        assert_eq!(config.lifecycle.min_hits, 5);
        assert_eq!(config.lifecycle.window_capacity, 10);
        assert_eq!(config.world_frame, "world");
    }

    #[test]
    fn test_config_validation() {
        let err = TrackerConfig::from_json(r#"{ "lifecycle": { "timeout": 0.0 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        let err = TrackerConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unbounded_frame_budget_never_overruns() {
        let mut config = TrackerConfig::default();
        config.lifecycle.frame_budget = f64::INFINITY;
        assert!(config.validate().is_ok());

        let mut tracker = FaceTracker::new(config);
        let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        let tf = crate::tracker::StaticTransforms::new();
        for i in 0..3 {
            let output = tracker.update(&Frame::new(i as f64, "camera", camera, Vec::new()), &tf);
            assert_eq!(output.health.status, Health::Healthy);
            assert_eq!(output.health.consecutive_overruns, 0);
        }

        let mut config = TrackerConfig::default();
        config.lifecycle.frame_budget = -1.0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        config.lifecycle.frame_budget = f64::NAN;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_config_serializes() {
        let config = TrackerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(TrackerConfig::from_json(&json).unwrap(), config);
    }
}
