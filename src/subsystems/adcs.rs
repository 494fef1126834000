use super::{FlightAgent, ModeCache, SubsystemId};
use crate::ahrs::AttitudeEstimator;
use crate::config::AhrsConfig;
use crate::protocol::{AdcsStatus, BusMessage, Topic, Vector3Reading};
use crate::sensors::InertialSensor;
use chrono::Utc;
use nalgebra::Vector3;
use std::time::{Duration, Instant};
use tracing::warn;

pub struct AdcsAgent {
    imu: Box<dyn InertialSensor>,
    estimator: AttitudeEstimator,
    interval: Duration,
    mode: ModeCache,
    mag_timeouts: u32,
}

impl AdcsAgent {
    pub fn new(imu: Box<dyn InertialSensor>, ahrs: &AhrsConfig, interval: Duration) -> Self {
        Self {
            imu,
            estimator: AttitudeEstimator::with_interval(ahrs, interval),
            interval,
            mode: ModeCache::new(),
            mag_timeouts: 0,
        }
    }

    /// Reads the IMU, steps the filter and reports the attitude.
    /// Returns `None` when the inertial read itself fails.
    pub fn sample(&mut self) -> Option<AdcsStatus> {
        let inertial = match self.imu.read_inertial() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("IMU read failed: {}", e);
                return None;
            }
        };

        let mag = match self.imu.read_magnetometer() {
            Ok(Some(mag)) => mag,
            Ok(None) => {
                self.mag_timeouts += 1;
                Vector3::zeros()
            }
            Err(e) => {
                warn!("Magnetometer read failed: {}", e);
                Vector3::zeros()
            }
        };

        self.estimator.update(inertial.gyro_rad_s, inertial.accel_g, mag);
        let euler = self.estimator.euler_degrees();

        let imu_temp_c = match self.imu.read_temperature() {
            Ok(temp) if temp.is_finite() => Some(temp),
            Ok(_) => None,
            Err(e) => {
                warn!("IMU temperature unavailable: {}", e);
                None
            }
        };

        let gyro_dps = inertial.gyro_rad_s.map(f64::to_degrees);
        Some(AdcsStatus {
            timestamp: Utc::now(),
            roll_deg: euler.roll_deg,
            pitch_deg: euler.pitch_deg,
            yaw_deg: euler.yaw_deg,
            imu_temp_c,
            accel_g: Vector3Reading::new(inertial.accel_g.x, inertial.accel_g.y, inertial.accel_g.z),
            gyro_dps: Vector3Reading::new(gyro_dps.x, gyro_dps.y, gyro_dps.z),
        })
    }

    pub fn estimator(&self) -> &AttitudeEstimator {
        &self.estimator
    }

    pub fn magnetometer_timeouts(&self) -> u32 {
        self.mag_timeouts
    }
}

impl FlightAgent for AdcsAgent {
    fn id(&self) -> SubsystemId {
        SubsystemId::Adcs
    }

    fn subscriptions(&self) -> &'static [Topic] {
        &[Topic::ModeStatus]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage> {
        self.mode.observe(&message);
        Vec::new()
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<BusMessage> {
        self.sample().map(BusMessage::Adcs).into_iter().collect()
    }
}
