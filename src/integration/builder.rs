//! Builder for creating Detection objects from loose keypoint output.

use nalgebra::Point2;

use crate::error::ObservationError;
use crate::tracker::{Detection, FaceKeypoint, ImageCrop};

/// Builder for creating `Detection` objects one keypoint at a time.
#[derive(Debug, Clone, Default)]
pub struct DetectionBuilder {
    keypoints: [Option<Point2<f64>>; FaceKeypoint::COUNT],
    confidence: f64,
    speaking_score: Option<f64>,
    pose_events: Vec<String>,
    crop: Option<ImageCrop>,
}

impl DetectionBuilder {
    /// Create a new detection builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pixel location of one keypoint.
    pub fn keypoint(mut self, kp: FaceKeypoint, x: f64, y: f64) -> Self {
        self.keypoints[kp.index()] = Some(Point2::new(x, y));
        self
    }

    /// Set every keypoint from a flat `[x0, y0, x1, y1, ...]` slice in [`FaceKeypoint`] order.
    pub fn flat_keypoints(mut self, coords: &[f64]) -> Self {
        for (slot, xy) in self.keypoints.iter_mut().zip(coords.chunks_exact(2)) {
            *slot = Some(Point2::new(xy[0], xy[1]));
        }
        self
    }

    /// Set the detector confidence.
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn speaking_score(mut self, score: f64) -> Self {
        self.speaking_score = Some(score);
        self
    }

    pub fn pose_event(mut self, name: impl Into<String>) -> Self {
        self.pose_events.push(name.into());
        self
    }

    pub fn crop(mut self, crop: ImageCrop) -> Self {
        self.crop = Some(crop);
        self
    }

    /// Build the final `Detection`, failing on the first keypoint never set.
    pub fn build(self) -> Result<Detection, ObservationError> {
        let mut keypoints = [Point2::origin(); FaceKeypoint::COUNT];
        for kp in FaceKeypoint::ALL {
            keypoints[kp.index()] = self.keypoints[kp.index()].ok_or(ObservationError::MissingKeypoint(kp))?;
        }

        let mut det = Detection::new(self.confidence, keypoints);
        det.speaking_score = self.speaking_score;
        det.pose_events = self.pose_events;
        det.crop = self.crop;
        det.validate()?;
        Ok(det)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> DetectionBuilder {
        DetectionBuilder::new()
            .keypoint(FaceKeypoint::EyeRight, 300.0, 200.0)
            .keypoint(FaceKeypoint::EyeLeft, 340.0, 200.0)
            .keypoint(FaceKeypoint::Nose, 320.0, 220.0)
            .keypoint(FaceKeypoint::Mouth, 320.0, 245.0)
            .keypoint(FaceKeypoint::EarRight, 280.0, 215.0)
            .keypoint(FaceKeypoint::EarLeft, 360.0, 215.0)
    }

    #[test]
    fn test_detection_builder() {
        let det = complete()
            .confidence(0.95)
            .speaking_score(0.7)
            .pose_event("nod")
            .build()
            .unwrap();

        assert_eq!(det.confidence, 0.95);
        assert_eq!(det.keypoint(FaceKeypoint::Mouth), Point2::new(320.0, 245.0));
        assert_eq!(det.speaking_score, Some(0.7));
        assert_eq!(det.pose_events, vec!["nod".to_string()]);
    }

    #[test]
    fn test_missing_keypoint() {
        let err = DetectionBuilder::new()
            .keypoint(FaceKeypoint::EyeRight, 1.0, 1.0)
            .confidence(0.5)
            .build()
            .unwrap_err();
        assert_eq!(err, ObservationError::MissingKeypoint(FaceKeypoint::EyeLeft));
    }

    #[test]
    fn test_flat_keypoints_and_validation() {
        let coords = [300.0, 200.0, 340.0, 200.0, 320.0, 220.0, 320.0, 245.0, 280.0, 215.0, 360.0, 215.0];
        let det = DetectionBuilder::new().flat_keypoints(&coords).confidence(0.8).build().unwrap();
        assert_eq!(det.keypoint(FaceKeypoint::EarLeft), Point2::new(360.0, 215.0));

        assert_eq!(
            complete().confidence(1.5).build().unwrap_err(),
            ObservationError::InvalidConfidence
        );
    }
}
