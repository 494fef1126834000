//! Proportional-integral attitude filter (Mahony style) over a unit quaternion.
//!
//! Each [`AttitudeEstimator`] owns its quaternion and integral error terms, so
//! several estimators never share state. The half sample period is supplied by
//! the caller and must track the real polling rate.

use crate::config::AhrsConfig;
use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Vectors with a smaller magnitude are left un-normalized.
const NORM_EPSILON: f64 = 0.001;
/// A quaternion this close to zero cannot be renormalized.
const DEGENERATE_NORM: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EulerAngles {
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
}

#[derive(Debug, Clone)]
pub struct AttitudeEstimator {
    q: Quaternion<f64>,
    integral: Vector3<f64>,
    kp: f64,
    ki: f64,
    half_period: f64,
    magnetic: Vector3<f64>,
}

impl AttitudeEstimator {
    pub fn new(kp: f64, ki: f64, half_period: f64) -> Self {
        Self {
            q: Quaternion::identity(),
            integral: Vector3::zeros(),
            kp,
            ki,
            half_period,
            magnetic: Vector3::zeros(),
        }
    }

    /// Half period derived from the sampling interval.
    pub fn with_interval(config: &AhrsConfig, interval: Duration) -> Self {
        Self::new(config.kp, config.ki, interval.as_secs_f64() / 2.0)
    }

    pub fn half_period(&self) -> f64 {
        self.half_period
    }

    pub fn set_half_period(&mut self, half_period: f64) {
        self.half_period = half_period;
    }

    /// `(q0, q1, q2, q3)` with `q0` the scalar part.
    pub fn quaternion(&self) -> [f64; 4] {
        [self.q.w, self.q.i, self.q.j, self.q.k]
    }

    pub fn integral_error(&self) -> Vector3<f64> {
        self.integral
    }

    /// Last normalized magnetometer sample. Heading correction does not use it.
    pub fn last_magnetic(&self) -> Vector3<f64> {
        self.magnetic
    }

    pub fn reset(&mut self) {
        self.q = Quaternion::identity();
        self.integral = Vector3::zeros();
    }

    /// One filter step. `gyro` in rad/s, `accel` in g, `mag` in arbitrary units.
    pub fn update(&mut self, gyro: Vector3<f64>, accel: Vector3<f64>, mag: Vector3<f64>) {
        let finite = |v: &Vector3<f64>| v.iter().all(|c| c.is_finite());
        if !(finite(&gyro) && finite(&accel) && finite(&mag)) {
            return;
        }

        let accel = normalized(accel);
        self.magnetic = normalized(mag);

        let (q0, q1, q2, q3) = (self.q.w, self.q.i, self.q.j, self.q.k);

        // Gravity direction in the body frame as predicted by the current attitude
        let estimated = Vector3::new(
            2.0 * (q1 * q3 - q0 * q2),
            2.0 * (q0 * q1 + q2 * q3),
            q0 * q0 - q1 * q1 - q2 * q2 + q3 * q3,
        );

        let error = accel.cross(&estimated);
        self.integral += error * (self.ki * self.half_period);

        let rate = gyro + error * self.kp + self.integral;
        let (gx, gy, gz) = (rate.x, rate.y, rate.z);
        let ht = self.half_period;

        let next = Quaternion::new(
            q0 + (-q1 * gx - q2 * gy - q3 * gz) * ht,
            q1 + (q0 * gx + q2 * gz - q3 * gy) * ht,
            q2 + (q0 * gy - q1 * gz + q3 * gx) * ht,
            q3 + (q0 * gz + q1 * gy - q2 * gx) * ht,
        );

        let norm = next.norm();
        if norm.is_finite() && norm > DEGENERATE_NORM {
            self.q = next / norm;
        }
    }

    /// ZYX Euler angles in degrees.
    pub fn euler_degrees(&self) -> EulerAngles {
        let (q0, q1, q2, q3) = (self.q.w, self.q.i, self.q.j, self.q.k);

        let roll = (2.0 * (q2 * q3 + q0 * q1)).atan2(1.0 - 2.0 * (q1 * q1 + q2 * q2));
        let pitch = (2.0 * (q0 * q2 - q1 * q3)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (q0 * q3 + q1 * q2)).atan2(1.0 - 2.0 * (q2 * q2 + q3 * q3));

        EulerAngles {
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees(),
        }
    }
}

fn normalized(v: Vector3<f64>) -> Vector3<f64> {
    let norm = v.norm();
    if norm > NORM_EPSILON {
        v / norm
    } else {
        v
    }
}
