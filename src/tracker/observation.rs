//! Raw face detections and their conversion into world-space observations.

use std::sync::Arc;

use nalgebra::{Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ObservationError;
use crate::tracker::camera::{FrameGeometry, Ray};

/// Fixed keypoint topology produced by the face detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaceKeypoint {
    EyeRight = 0,
    EyeLeft = 1,
    Nose = 2,
    Mouth = 3,
    EarRight = 4,
    EarLeft = 5,
}

impl FaceKeypoint {
    pub const COUNT: usize = 6;

    pub const ALL: [FaceKeypoint; Self::COUNT] = [
        FaceKeypoint::EyeRight,
        FaceKeypoint::EyeLeft,
        FaceKeypoint::Nose,
        FaceKeypoint::Mouth,
        FaceKeypoint::EarRight,
        FaceKeypoint::EarLeft,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Secondary landmarks tracked with their own filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaccadePoint {
    EyeRight = 0,
    EyeLeft = 1,
    Nose = 2,
}

impl SaccadePoint {
    pub const COUNT: usize = 3;

    pub const ALL: [SaccadePoint; Self::COUNT] =
        [SaccadePoint::EyeRight, SaccadePoint::EyeLeft, SaccadePoint::Nose];
}

/// Image region handed to the identity service for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCrop {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

/// One face as reported by the 2D detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub confidence: f64,
    /// Pixel keypoints indexed by [`FaceKeypoint`].
    pub keypoints: [Point2<f64>; FaceKeypoint::COUNT],
    pub pose_events: Vec<String>,
    pub speaking_score: Option<f64>,
    pub crop: Option<ImageCrop>,
}

impl Detection {
    pub fn new(confidence: f64, keypoints: [Point2<f64>; FaceKeypoint::COUNT]) -> Self {
        Self {
            confidence,
            keypoints,
            pose_events: Vec::new(),
            speaking_score: None,
            crop: None,
        }
    }

    #[inline]
    pub fn keypoint(&self, kp: FaceKeypoint) -> Point2<f64> {
        self.keypoints[kp.index()]
    }

    /// Reject detections that cannot describe a face.
    pub fn validate(&self) -> Result<(), ObservationError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ObservationError::InvalidConfidence);
        }
        for (index, kp) in self.keypoints.iter().enumerate() {
            if !kp.x.is_finite() || !kp.y.is_finite() {
                return Err(ObservationError::MalformedKeypoint { index });
            }
        }
        Ok(())
    }
}

/// Which way the head is turned, from the person's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDirection {
    Left,
    Right,
}

/// A detection lifted into the world frame. Lives for one frame only.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Index of the source detection within its frame.
    pub id: usize,
    pub timestamp: f64,
    pub confidence: f64,
    pub keypoints: [Point2<f64>; FaceKeypoint::COUNT],
    /// World-frame rays through each keypoint.
    pub rays: [Ray; FaceKeypoint::COUNT],
    /// Estimated distance from the camera to the face plane.
    pub distance: f64,
    pub camera_origin: Point3<f64>,
    pub head: Point3<f64>,
    /// World points indexed by [`SaccadePoint`].
    pub saccades: [Point3<f64>; SaccadePoint::COUNT],
    pub turn: TurnDirection,
    /// Head turn about world z, positive towards the person's left.
    pub yaw: f64,
    /// Eye-line tilt, positive when the left eye is higher.
    pub roll: f64,
    pub pose_events: Vec<String>,
    pub speaking_score: Option<f64>,
    pub crop: Option<ImageCrop>,
}

impl Observation {
    /// Unit direction from the camera to the head.
    pub fn view_direction(&self) -> Vector3<f64> {
        (self.head - self.camera_origin)
            .try_normalize(f64::EPSILON)
            .unwrap_or_else(Vector3::x)
    }
}

/// Physical face proportions used to recover depth and pose from keypoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceGeometry {
    /// Vertical distance from the eye center to the mouth, in meters.
    pub eye_mouth_distance: f64,
    /// Inter-eye distance divided by eye-to-mouth distance for a face seen head-on.
    pub face_on_eye_ratio: f64,
    /// Distance from the face plane back to the head center.
    pub head_depth: f64,
    /// Face radius used for occlusion tests.
    pub face_radius: f64,
}

impl Default for FaceGeometry {
    fn default() -> Self {
        Self {
            eye_mouth_distance: 0.07,
            face_on_eye_ratio: 0.9,
            head_depth: 0.08,
            face_radius: 0.1,
        }
    }
}

/// Turns detections into observations.
///
/// Assumes a level face with eyes and mouth on one plane.
#[derive(Debug, Clone, Default)]
pub struct ObservationBuilder {
    pub geometry: FaceGeometry,
}

impl ObservationBuilder {
    pub fn new(geometry: FaceGeometry) -> Self {
        Self { geometry }
    }

    pub fn build(
        &self,
        id: usize,
        detection: &Detection,
        frame: &FrameGeometry<'_>,
        timestamp: f64,
    ) -> Result<Observation, ObservationError> {
        detection.validate()?;

        let mut rays = Vec::with_capacity(FaceKeypoint::COUNT);
        for kp in &detection.keypoints {
            rays.push(frame.pixel_ray(kp)?);
        }
        let rays: [Ray; FaceKeypoint::COUNT] = rays
            .try_into()
            .map_err(|_| ObservationError::Degenerate("keypoint count"))?;

        let origin = rays[FaceKeypoint::Mouth.index()].origin;
        let dir = |kp: FaceKeypoint| rays[kp.index()].direction.into_inner();

        // Depth from the height of the triangle spanned by the unit eye and mouth rays.
        let eye_r = dir(FaceKeypoint::EyeRight);
        let eye_l = dir(FaceKeypoint::EyeLeft);
        let mouth = dir(FaceKeypoint::Mouth);
        let eye_line = eye_l - eye_r;
        let eye_span = eye_line.norm();
        if eye_span < f64::EPSILON {
            return Err(ObservationError::Degenerate("eyes coincide"));
        }
        let unit_height = eye_line.cross(&(mouth - eye_r)).norm() / eye_span;
        if unit_height < f64::EPSILON {
            return Err(ObservationError::Degenerate("mouth on the eye line"));
        }
        let distance = self.geometry.eye_mouth_distance / unit_height;
        if !distance.is_finite() {
            return Err(ObservationError::Degenerate("distance"));
        }

        let point = |kp: FaceKeypoint| rays[kp.index()].at(distance);
        let eye_r_pt = point(FaceKeypoint::EyeRight);
        let eye_l_pt = point(FaceKeypoint::EyeLeft);
        let nose_pt = point(FaceKeypoint::Nose);
        let mouth_pt = point(FaceKeypoint::Mouth);

        let anchor = Point3::from((eye_r_pt.coords + eye_l_pt.coords + mouth_pt.coords * 2.0) / 4.0);
        let view = (anchor - origin)
            .try_normalize(f64::EPSILON)
            .ok_or(ObservationError::Degenerate("face at camera origin"))?;
        let head = anchor + view * self.geometry.head_depth;

        let (yaw, turn) = self.yaw(detection)?;

        let eye_vec = eye_l_pt - eye_r_pt;
        let roll = eye_vec.z.atan2(eye_vec.x.hypot(eye_vec.y));

        Ok(Observation {
            id,
            timestamp,
            confidence: detection.confidence,
            keypoints: detection.keypoints,
            rays,
            distance,
            camera_origin: origin,
            head,
            saccades: [eye_r_pt, eye_l_pt, nose_pt],
            turn,
            yaw,
            roll,
            pose_events: detection.pose_events.clone(),
            speaking_score: detection.speaking_score,
            crop: detection.crop.clone(),
        })
    }

    /// Yaw magnitude from eye foreshortening, sign from where the nose sits.
    fn yaw(&self, detection: &Detection) -> Result<(f64, TurnDirection), ObservationError> {
        let eye_r = detection.keypoint(FaceKeypoint::EyeRight);
        let eye_l = detection.keypoint(FaceKeypoint::EyeLeft);
        let nose = detection.keypoint(FaceKeypoint::Nose);
        let mouth = detection.keypoint(FaceKeypoint::Mouth);

        let eye_line = eye_l - eye_r;
        let eye_px = eye_line.norm();
        if eye_px < f64::EPSILON {
            return Err(ObservationError::Degenerate("eyes coincide"));
        }
        let eye_center = Point2::from((eye_r.coords + eye_l.coords) / 2.0);
        let mouth_vec = eye_center - mouth;

        let vertical_px = (eye_line.x * (mouth - eye_r).y - eye_line.y * (mouth - eye_r).x).abs() / eye_px;
        let face_on_px = vertical_px * self.geometry.face_on_eye_ratio;
        if face_on_px < f64::EPSILON {
            return Err(ObservationError::Degenerate("mouth on the eye line"));
        }

        let magnitude = (eye_px / face_on_px).clamp(-1.0, 1.0).acos();

        // Image y points down: a negative cross means the nose sits to the image
        // right of the eye-mouth axis, i.e. towards the person's left.
        let nose_vec = nose - mouth;
        let cross = nose_vec.x * mouth_vec.y - nose_vec.y * mouth_vec.x;
        let turn = if cross < 0.0 {
            TurnDirection::Left
        } else {
            TurnDirection::Right
        };

        let yaw = match turn {
            TurnDirection::Left => magnitude,
            TurnDirection::Right => -magnitude,
        };
        Ok((yaw, turn))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tracker::camera::{FrameConverter, PinholeCamera, StaticTransforms, forward_camera_pose};
    use nalgebra::{UnitQuaternion, Vector3};

    /// Keypoints of a face whose head center sits at `head`, looking back at
    /// the camera and turned by `yaw`.
    pub(crate) fn synthetic_detection(
        camera: &PinholeCamera,
        converter: &dyn FrameConverter,
        head: Point3<f64>,
        yaw: f64,
        confidence: f64,
    ) -> Detection {
        let geometry = FaceGeometry::default();
        let origin = converter
            .convert_point(&Point3::origin(), "camera", "world", 0.0)
            .unwrap();
        let to_camera = Vector3::new(origin.x - head.x, origin.y - head.y, 0.0).normalize();
        let facing = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw) * to_camera;
        let right = facing.cross(&Vector3::z());
        let up = Vector3::z();

        let anchor = head - (head - origin).normalize() * geometry.head_depth;
        let half_eye = geometry.eye_mouth_distance * geometry.face_on_eye_ratio / 2.0;
        let eye_center = anchor + up * geometry.eye_mouth_distance / 2.0;
        let world = [
            eye_center + right * half_eye,
            eye_center - right * half_eye,
            eye_center - up * 0.035 + facing * 0.03,
            anchor - up * geometry.eye_mouth_distance / 2.0,
            anchor + right * 0.075 - facing * 0.08,
            anchor - right * 0.075 - facing * 0.08,
        ];

        let keypoints = world.map(|p| {
            let local = converter.convert_point(&p, "world", "camera", 0.0).unwrap();
            camera.project(&local).unwrap_or(Point2::new(-1.0, -1.0))
        });
        Detection::new(confidence, keypoints)
    }

    fn scene() -> (PinholeCamera, StaticTransforms) {
        let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        let tf = StaticTransforms::new().with("camera", "world", forward_camera_pose(Point3::new(0.0, 0.0, 1.2), 0.0));
        (camera, tf)
    }

    #[test]
    fn test_build_recovers_head_position() {
        let (camera, tf) = scene();
        let geometry = FrameGeometry::new(&camera, &tf, "camera", "world", 0.0);
        let head = Point3::new(2.0, 0.3, 1.3);
        let det = synthetic_detection(&camera, &tf, head, 0.0, 0.9);

        let obs = ObservationBuilder::default().build(0, &det, &geometry, 0.0).unwrap();
        assert!((obs.head - head).norm() < 0.05, "head {:?}", obs.head);
        assert!(obs.yaw.abs() < 0.2);
        assert!(obs.roll.abs() < 1e-6);
        assert_eq!(obs.confidence, 0.9);
    }

    #[test]
    fn test_yaw_sign_follows_turn() {
        let (camera, tf) = scene();
        let geometry = FrameGeometry::new(&camera, &tf, "camera", "world", 0.0);
        let builder = ObservationBuilder::default();
        let head = Point3::new(1.5, 0.0, 1.2);

        let left = builder
            .build(0, &synthetic_detection(&camera, &tf, head, 0.5, 0.9), &geometry, 0.0)
            .unwrap();
        let right = builder
            .build(0, &synthetic_detection(&camera, &tf, head, -0.5, 0.9), &geometry, 0.0)
            .unwrap();

        assert_eq!(left.turn, TurnDirection::Left);
        assert_eq!(right.turn, TurnDirection::Right);
        assert!((left.yaw - 0.5).abs() < 0.15, "yaw {}", left.yaw);
        assert!((right.yaw + 0.5).abs() < 0.15, "yaw {}", right.yaw);
    }

    #[test]
    fn test_roll_from_tilted_eyes() {
        let (camera, tf) = scene();
        let geometry = FrameGeometry::new(&camera, &tf, "camera", "world", 0.0);
        let mut det = synthetic_detection(&camera, &tf, Point3::new(1.5, 0.0, 1.2), 0.0, 0.9);
        // lift the left eye in the image
        det.keypoints[FaceKeypoint::EyeLeft.index()].y -= 4.0;

        let obs = ObservationBuilder::default().build(0, &det, &geometry, 0.0).unwrap();
        assert!(obs.roll > 0.0);
    }

    #[test]
    fn test_missing_transform_drops_detection() {
        let (camera, tf) = scene();
        let det = synthetic_detection(&camera, &tf, Point3::new(1.5, 0.0, 1.2), 0.0, 0.9);
        let empty = StaticTransforms::new();
        let geometry = FrameGeometry::new(&camera, &empty, "camera", "world", 0.0);
        let err = ObservationBuilder::default().build(0, &det, &geometry, 0.0).unwrap_err();
        assert!(matches!(err, ObservationError::MissingTransform { .. }));
    }

    #[test]
    fn test_malformed_keypoints_are_rejected() {
        let (camera, tf) = scene();
        let geometry = FrameGeometry::new(&camera, &tf, "camera", "world", 0.0);
        let mut det = synthetic_detection(&camera, &tf, Point3::new(1.5, 0.0, 1.2), 0.0, 0.9);
        det.keypoints[2].x = f64::NAN;
        let err = ObservationBuilder::default().build(0, &det, &geometry, 0.0).unwrap_err();
        assert_eq!(err, ObservationError::MalformedKeypoint { index: 2 });

        det.keypoints[2].x = 300.0;
        det.confidence = 1.5;
        let err = ObservationBuilder::default().build(0, &det, &geometry, 0.0).unwrap_err();
        assert_eq!(err, ObservationError::InvalidConfidence);
    }

    #[test]
    fn test_collapsed_face_is_degenerate() {
        let (camera, tf) = scene();
        let geometry = FrameGeometry::new(&camera, &tf, "camera", "world", 0.0);
        let det = Detection::new(0.9, [Point2::new(100.0, 100.0); FaceKeypoint::COUNT]);
        let err = ObservationBuilder::default().build(0, &det, &geometry, 0.0).unwrap_err();
        assert!(matches!(err, ObservationError::Degenerate(_)));
    }
}
