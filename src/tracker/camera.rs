//! Pinhole camera model and conversion between named reference frames.
//!
//! Camera frames follow the optical convention: z forward, x right, y down.
//! The world frame is z up.

use std::collections::HashMap;

use nalgebra::{Isometry3, Matrix3, Point2, Point3, Rotation3, Translation3, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ObservationError;

/// Points closer than this to the image plane do not project.
const MIN_DEPTH: f64 = 1e-3;

/// Pinhole intrinsics plus the image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
}

impl PinholeCamera {
    #[inline]
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Square-pixel camera with the principal point at the image center.
    pub fn from_fov(width: f64, height: f64, horizontal_fov: f64) -> Self {
        let f = (width / 2.0) / (horizontal_fov / 2.0).tan();
        Self::new(f, f, width / 2.0, height / 2.0, width, height)
    }

    /// Unit ray through `pixel`, in the camera's optical frame.
    pub fn pixel_ray(&self, pixel: &Point2<f64>) -> Unit<Vector3<f64>> {
        Unit::new_normalize(Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        ))
    }

    /// Project a point given in the optical frame. `None` for points behind the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= MIN_DEPTH {
            return None;
        }
        Some(Point2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Signed distance from `pixel` to the nearest image border; negative outside the image.
    #[inline]
    pub fn edge_distance(&self, pixel: &Point2<f64>) -> f64 {
        pixel
            .x
            .min(self.width - pixel.x)
            .min(pixel.y)
            .min(self.height - pixel.y)
    }
}

/// Pose of a level optical frame at `origin`, looking along `heading` (radians about world z).
pub fn forward_camera_pose(origin: Point3<f64>, heading: f64) -> Isometry3<f64> {
    // optical z -> world x, optical x -> world -y, optical y -> world -z
    let optical = Rotation3::from_matrix_unchecked(Matrix3::new(
        0.0, 0.0, 1.0, //
        -1.0, 0.0, 0.0, //
        0.0, -1.0, 0.0,
    ));
    let rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), heading)
        * UnitQuaternion::from_rotation_matrix(&optical);
    Isometry3::from_parts(Translation3::from(origin.coords), rotation)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Unit<Vector3<f64>>,
}

impl Ray {
    #[inline]
    pub fn at(&self, distance: f64) -> Point3<f64> {
        self.origin + self.direction.into_inner() * distance
    }

    pub fn transformed(&self, iso: &Isometry3<f64>) -> Ray {
        Ray {
            origin: iso * self.origin,
            direction: iso.rotation * self.direction,
        }
    }
}

/// Conversion between named reference frames.
///
/// `transform` returns the isometry mapping coordinates in `from` to coordinates
/// in `to`, or `None` while that transform is unknown.
pub trait FrameConverter {
    fn transform(&self, from: &str, to: &str, timestamp: f64) -> Option<Isometry3<f64>>;

    fn convert_point(&self, point: &Point3<f64>, from: &str, to: &str, timestamp: f64) -> Option<Point3<f64>> {
        self.transform(from, to, timestamp).map(|iso| iso * point)
    }

    fn convert_ray(&self, ray: &Ray, from: &str, to: &str, timestamp: f64) -> Option<Ray> {
        self.transform(from, to, timestamp).map(|iso| ray.transformed(&iso))
    }
}

/// Fixed transforms between frames, looked up in either direction.
#[derive(Debug, Clone, Default)]
pub struct StaticTransforms {
    transforms: HashMap<(String, String), Isometry3<f64>>,
}

impl StaticTransforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the isometry taking `from` coordinates into `to` coordinates.
    pub fn insert(&mut self, from: &str, to: &str, iso: Isometry3<f64>) -> &mut Self {
        self.transforms.insert((from.to_string(), to.to_string()), iso);
        self
    }

    pub fn with(mut self, from: &str, to: &str, iso: Isometry3<f64>) -> Self {
        self.insert(from, to, iso);
        self
    }

    pub fn remove(&mut self, from: &str, to: &str) -> Option<Isometry3<f64>> {
        self.transforms.remove(&(from.to_string(), to.to_string()))
    }
}

impl FrameConverter for StaticTransforms {
    fn transform(&self, from: &str, to: &str, _timestamp: f64) -> Option<Isometry3<f64>> {
        if from == to {
            return Some(Isometry3::identity());
        }
        if let Some(iso) = self.transforms.get(&(from.to_string(), to.to_string())) {
            return Some(*iso);
        }
        self.transforms
            .get(&(to.to_string(), from.to_string()))
            .map(|iso| iso.inverse())
    }
}

/// Camera geometry of a single frame, borrowed for the duration of one update.
#[derive(Clone, Copy)]
pub struct FrameGeometry<'a> {
    pub camera: &'a PinholeCamera,
    converter: &'a dyn FrameConverter,
    camera_frame: &'a str,
    world_frame: &'a str,
    timestamp: f64,
}

impl<'a> FrameGeometry<'a> {
    pub fn new(
        camera: &'a PinholeCamera,
        converter: &'a dyn FrameConverter,
        camera_frame: &'a str,
        world_frame: &'a str,
        timestamp: f64,
    ) -> Self {
        Self {
            camera,
            converter,
            camera_frame,
            world_frame,
            timestamp,
        }
    }

    fn missing_transform(&self) -> ObservationError {
        ObservationError::MissingTransform {
            from: self.camera_frame.to_string(),
            to: self.world_frame.to_string(),
        }
    }

    /// World-frame ray through `pixel`.
    pub fn pixel_ray(&self, pixel: &Point2<f64>) -> Result<Ray, ObservationError> {
        let ray = Ray {
            origin: Point3::origin(),
            direction: self.camera.pixel_ray(pixel),
        };
        self.converter
            .convert_ray(&ray, self.camera_frame, self.world_frame, self.timestamp)
            .ok_or_else(|| self.missing_transform())
    }

    /// Pixel position of a world-frame point, if it lies in front of the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        let local = self
            .converter
            .convert_point(point, self.world_frame, self.camera_frame, self.timestamp)?;
        self.camera.project(&local)
    }

    pub fn camera_origin(&self) -> Option<Point3<f64>> {
        self.converter
            .convert_point(&Point3::origin(), self.camera_frame, self.world_frame, self.timestamp)
    }
}
