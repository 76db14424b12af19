//! Constant-velocity Kalman filters with a constant-acceleration process noise model.
//!
//! Two variants share the same discretized equations:
//!
//! ```text
//! var_xx += q*dt^4/4 + cov_xy*2*dt + var_yy*dt^2
//! cov_xy += q*dt^3/2 + var_yy*dt
//! var_yy += q*dt^2
//! ```
//!
//! [`ScalarKalman`] tracks a single coordinate. [`Kalman3`] tracks a 3D point with
//! 3x3 covariance blocks and builds anisotropic measurement noise from the
//! camera viewing direction, since a camera measures bearing far better than depth.

use nalgebra::{Cholesky, Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Below this |z| the viewing direction is treated as horizontal.
const PLANAR_EPS: f64 = 1e-6;
/// Distances are clamped to this when building measurement noise.
const MIN_NOISE_DISTANCE: f64 = 0.05;

/// Scalar constant-velocity Kalman filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarKalman {
    pub pos: f64,
    pub vel: f64,
    pub var_xx: f64,
    pub cov_xy: f64,
    pub var_yy: f64,
    /// Acceleration variance (units²/s³).
    pub q: f64,
    /// Time of the current estimate, in seconds.
    pub time: f64,
}

impl ScalarKalman {
    pub fn new(pos: f64, pos_var: f64, vel_var: f64, q: f64, time: f64) -> Self {
        Self {
            pos,
            vel: 0.0,
            var_xx: pos_var,
            cov_xy: 0.0,
            var_yy: vel_var,
            q,
            time,
        }
    }

    /// Advance the estimate to `now`. Timestamps at or before the current one are ignored.
    pub fn predict(&mut self, now: f64) {
        let dt = now - self.time;
        if dt <= 0.0 {
            return;
        }
        let dt2 = dt * dt;

        self.pos += self.vel * dt;

        let var_xx = self.var_xx + self.q * dt2 * dt2 / 4.0 + self.cov_xy * 2.0 * dt + self.var_yy * dt2;
        let cov_xy = self.cov_xy + self.q * dt2 * dt / 2.0 + self.var_yy * dt;
        let var_yy = self.var_yy + self.q * dt2;

        self.var_xx = var_xx;
        self.cov_xy = cov_xy;
        self.var_yy = var_yy;
        self.time = now;
    }

    /// Fuse a position measurement with variance `noise`.
    pub fn update(&mut self, measurement: f64, noise: f64) -> Result<(), FilterError> {
        let s = self.var_xx + noise;
        if !s.is_finite() || s <= f64::EPSILON {
            return Err(FilterError::SingularCovariance);
        }

        let k_pos = self.var_xx / s;
        let k_vel = self.cov_xy / s;
        let innovation = measurement - self.pos;

        self.pos += k_pos * innovation;
        self.vel += k_vel * innovation;

        let (xx, xy, yy) = (self.var_xx, self.cov_xy, self.var_yy);
        self.var_xx = xx - k_pos * xx;
        self.cov_xy = xy - k_pos * xy;
        self.var_yy = yy - k_vel * xy;

        Ok(())
    }

    pub fn damp_velocity(&mut self, factor: f64) {
        self.vel *= factor;
        self.cov_xy *= factor;
        self.var_yy *= factor * factor;
    }
}

/// Coefficients of the view-dependent measurement noise.
///
/// At distance `d` the variance perpendicular to the viewing ray is
/// `tangential * d^2` and the variance along it is `radial * d^3`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementNoise {
    pub tangential: f64,
    pub radial: f64,
}

impl Default for MeasurementNoise {
    fn default() -> Self {
        Self {
            tangential: 1e-4,
            radial: 2.5e-3,
        }
    }
}

/// 3D constant-velocity Kalman filter.
///
/// The joint covariance is kept as three 3x3 blocks:
/// `[[pos_cov, cross_cov], [cross_cov^T, vel_cov]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kalman3 {
    pub pos: Vector3<f64>,
    pub vel: Vector3<f64>,
    pub pos_cov: Matrix3<f64>,
    pub cross_cov: Matrix3<f64>,
    pub vel_cov: Matrix3<f64>,
    pub q: f64,
    pub time: f64,
    pub noise: MeasurementNoise,
}

impl Kalman3 {
    pub fn new(
        pos: Vector3<f64>,
        pos_cov: Matrix3<f64>,
        vel_var: f64,
        q: f64,
        noise: MeasurementNoise,
        time: f64,
    ) -> Self {
        Self {
            pos,
            vel: Vector3::zeros(),
            pos_cov,
            cross_cov: Matrix3::zeros(),
            vel_cov: Matrix3::from_diagonal_element(vel_var),
            q,
            time,
            noise,
        }
    }

    /// Seed a filter from a first sighting, using the view-dependent noise as
    /// the initial position covariance.
    pub fn from_view(
        pos: Vector3<f64>,
        direction: &Vector3<f64>,
        distance: f64,
        vel_var: f64,
        q: f64,
        noise: MeasurementNoise,
        time: f64,
    ) -> Self {
        let pos_cov = pos_cov_matrix(&noise, direction, distance);
        Self::new(pos, pos_cov, vel_var, q, noise, time)
    }

    #[inline]
    pub fn position(&self) -> Point3<f64> {
        Point3::from(self.pos)
    }

    pub fn predict(&mut self, now: f64) {
        let dt = now - self.time;
        if dt <= 0.0 {
            return;
        }
        let dt2 = dt * dt;
        let q = self.q;

        self.pos += self.vel * dt;

        let pos_cov = self.pos_cov
            + (self.cross_cov + self.cross_cov.transpose()) * dt
            + self.vel_cov * dt2
            + Matrix3::from_diagonal_element(q * dt2 * dt2 / 4.0);
        let cross_cov =
            self.cross_cov + self.vel_cov * dt + Matrix3::from_diagonal_element(q * dt2 * dt / 2.0);
        let vel_cov = self.vel_cov + Matrix3::from_diagonal_element(q * dt2);

        self.pos_cov = pos_cov;
        self.cross_cov = cross_cov;
        self.vel_cov = vel_cov;
        self.time = now;
    }

    /// Fuse a position measurement with covariance `noise`.
    ///
    /// On a singular innovation covariance the state is left untouched.
    pub fn update(&mut self, measurement: &Vector3<f64>, noise: &Matrix3<f64>) -> Result<(), FilterError> {
        let s = self.pos_cov + noise;
        let s_inv = Cholesky::new(s)
            .map(|c| c.inverse())
            .filter(|inv| inv.iter().all(|v| v.is_finite()))
            .ok_or(FilterError::SingularCovariance)?;

        let gain_pos = self.pos_cov * s_inv;
        let gain_vel = self.cross_cov.transpose() * s_inv;
        let innovation = measurement - self.pos;

        self.pos += gain_pos * innovation;
        self.vel += gain_vel * innovation;

        let (pp, pv) = (self.pos_cov, self.cross_cov);
        self.pos_cov = symmetrize(pp - gain_pos * pp);
        self.cross_cov = pv - gain_pos * pv;
        self.vel_cov = symmetrize(self.vel_cov - gain_vel * pv);

        Ok(())
    }

    /// Fuse a measurement seen along `direction` from `distance` away.
    pub fn update_from_view(
        &mut self,
        measurement: &Vector3<f64>,
        direction: &Vector3<f64>,
        distance: f64,
    ) -> Result<(), FilterError> {
        let noise = self.get_pos_cov_matrix(direction, distance);
        self.update(measurement, &noise)
    }

    /// Measurement covariance for a point seen along `direction` at `distance`.
    pub fn get_pos_cov_matrix(&self, direction: &Vector3<f64>, distance: f64) -> Matrix3<f64> {
        pos_cov_matrix(&self.noise, direction, distance)
    }

    pub fn damp_velocity(&mut self, factor: f64) {
        self.vel *= factor;
        self.cross_cov *= factor;
        self.vel_cov *= factor * factor;
    }

    /// Total positional variance.
    #[inline]
    pub fn pos_variance(&self) -> f64 {
        self.pos_cov.trace()
    }
}

/// Rotate `diag(radial, tangential, tangential)` so its first axis lies along `direction`.
///
/// Any orthonormal completion of the view direction gives the same result,
/// `tangential * I + (radial - tangential) * u u^T`, so no explicit rotation is built.
pub fn pos_cov_matrix(noise: &MeasurementNoise, direction: &Vector3<f64>, distance: f64) -> Matrix3<f64> {
    let d = distance.max(MIN_NOISE_DISTANCE);
    let tangential = noise.tangential * d * d;
    let radial = noise.radial * d * d * d;

    let Some(u) = direction.try_normalize(f64::EPSILON) else {
        return Matrix3::from_diagonal_element(radial);
    };

    let extra = radial - tangential;

    if u.z.abs() < PLANAR_EPS {
        let planar = nalgebra::Vector2::new(u.x, u.y).normalize();
        let (x, y) = (planar.x, planar.y);
        return Matrix3::new(
            tangential + extra * x * x,
            extra * x * y,
            0.0,
            extra * x * y,
            tangential + extra * y * y,
            0.0,
            0.0,
            0.0,
            tangential,
        );
    }

    Matrix3::from_diagonal_element(tangential) + u * u.transpose() * extra
}

#[inline]
fn symmetrize(m: Matrix3<f64>) -> Matrix3<f64> {
    (m + m.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_scalar_predict_follows_discretized_model() {
        let mut kf = ScalarKalman::new(1.0, 0.5, 0.25, 2.0, 0.0);
        kf.vel = 3.0;
        kf.cov_xy = 0.1;
        kf.predict(0.5);

        let dt = 0.5_f64;
        assert!((kf.pos - 2.5).abs() < 1e-12);
        let var_xx = 0.5 + 2.0 * dt.powi(4) / 4.0 + 0.1 * 2.0 * dt + 0.25 * dt * dt;
        let cov_xy = 0.1 + 2.0 * dt.powi(3) / 2.0 + 0.25 * dt;
        let var_yy = 0.25 + 2.0 * dt * dt;
        assert!((kf.var_xx - var_xx).abs() < 1e-12);
        assert!((kf.cov_xy - cov_xy).abs() < 1e-12);
        assert!((kf.var_yy - var_yy).abs() < 1e-12);
        assert_eq!(kf.time, 0.5);
    }

    #[test]
    fn test_scalar_update_shrinks_variance() {
        let mut kf = ScalarKalman::new(0.0, 1.0, 1.0, 0.1, 0.0);
        kf.update(2.0, 1.0).unwrap();
        assert!((kf.pos - 1.0).abs() < 1e-12);
        assert!((kf.var_xx - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_scalar_singular_update_is_rejected() {
        let mut kf = ScalarKalman::new(0.0, 0.0, 1.0, 0.1, 0.0);
        assert_eq!(kf.update(1.0, 0.0), Err(FilterError::SingularCovariance));
        assert_eq!(kf.pos, 0.0);
    }

    #[test]
    fn test_stale_predict_is_ignored() {
        let mut kf = ScalarKalman::new(0.0, 1.0, 1.0, 0.1, 5.0);
        kf.vel = 1.0;
        kf.predict(4.0);
        assert_eq!(kf.pos, 0.0);
        assert_eq!(kf.time, 5.0);
    }

    #[test]
    fn test_kalman3_converges_on_stationary_target() {
        let truth = Vector3::new(2.0, -0.3, 0.4);
        let noise = MeasurementNoise::default();
        let dir = truth.normalize();
        let dist = truth.norm();
        let mut kf = Kalman3::from_view(Vector3::zeros(), &dir, 10.0, 0.25, 1e-3, noise, 0.0);
        let initial_variance = kf.pos_variance();

        let mut rng = StdRng::seed_from_u64(7);
        let cov = kf.get_pos_cov_matrix(&dir, dist);
        let std = cov.diagonal().map(f64::sqrt);
        let axes = [
            Normal::new(0.0, std.x).unwrap(),
            Normal::new(0.0, std.y).unwrap(),
            Normal::new(0.0, std.z).unwrap(),
        ];

        for i in 1..=300 {
            kf.predict(i as f64 / 30.0);
            let z = truth + Vector3::from_fn(|r, _| axes[r].sample(&mut rng));
            kf.update_from_view(&z, &dir, dist).unwrap();
        }

        assert!((kf.pos - truth).norm() < 0.05, "estimate {:?}", kf.pos);
        assert!(kf.pos_variance() < initial_variance);
    }

    #[test]
    fn test_kalman3_variance_grows_without_updates() {
        let noise = MeasurementNoise::default();
        let mut kf = Kalman3::from_view(
            Vector3::new(1.0, 0.0, 0.0),
            &Vector3::x(),
            1.0,
            0.25,
            0.5,
            noise,
            0.0,
        );
        let mut last = kf.pos_variance();
        for i in 1..=20 {
            kf.predict(i as f64 * 0.1);
            let var = kf.pos_variance();
            assert!(var > last);
            last = var;
        }
    }

    #[test]
    fn test_kalman3_update_shrinks_covariance() {
        let noise = MeasurementNoise::default();
        let mut kf = Kalman3::from_view(Vector3::new(1.0, 0.0, 0.0), &Vector3::x(), 1.0, 0.25, 0.5, noise, 0.0);
        kf.predict(0.1);
        let before = kf.pos_variance();
        kf.update_from_view(&Vector3::new(1.0, 0.0, 0.0), &Vector3::x(), 1.0).unwrap();
        assert!(kf.pos_variance() < before);
    }

    #[test]
    fn test_kalman3_singular_update_keeps_prediction() {
        let mut kf = Kalman3::new(
            Vector3::new(1.0, 2.0, 3.0),
            Matrix3::zeros(),
            0.0,
            0.0,
            MeasurementNoise::default(),
            0.0,
        );
        let before = kf.clone();
        let result = kf.update(&Vector3::zeros(), &Matrix3::zeros());
        assert_eq!(result, Err(FilterError::SingularCovariance));
        assert_eq!(kf, before);
    }

    #[test]
    fn test_cov_matrix_is_elongated_along_view() {
        let noise = MeasurementNoise::default();
        let dir = Vector3::new(1.0, 1.0, 0.5).normalize();
        let m = pos_cov_matrix(&noise, &dir, 2.0);

        let along = (dir.transpose() * m * dir)[0];
        let across_dir = dir.cross(&Vector3::z()).normalize();
        let across = (across_dir.transpose() * m * across_dir)[0];

        assert!((along - noise.radial * 8.0).abs() < 1e-12);
        assert!((across - noise.tangential * 4.0).abs() < 1e-12);
        assert!(along > across);
    }

    #[test]
    fn test_cov_matrix_planar_branch_matches_general_form() {
        let noise = MeasurementNoise::default();
        let flat = Vector3::new(0.6, 0.8, 0.0);
        let tilted = Vector3::new(0.6, 0.8, 1e-5).normalize();
        let a = pos_cov_matrix(&noise, &flat, 1.5);
        let b = pos_cov_matrix(&noise, &tilted, 1.5);
        assert!((a - b).norm() < 1e-6);
        assert_eq!(a[(0, 2)], 0.0);
        assert_eq!(a[(2, 2)], noise.tangential * 1.5 * 1.5);
    }

    #[test]
    fn test_damp_velocity() {
        let mut kf = Kalman3::new(Vector3::zeros(), Matrix3::identity(), 1.0, 0.1, MeasurementNoise::default(), 0.0);
        kf.vel = Vector3::new(1.0, -2.0, 0.5);
        kf.damp_velocity(0.5);
        assert_eq!(kf.vel, Vector3::new(0.5, -1.0, 0.25));
        assert!((kf.vel_cov[(0, 0)] - 0.25).abs() < 1e-12);
    }
}
