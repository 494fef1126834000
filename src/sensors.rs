use nalgebra::Vector3;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAG_READY_ATTEMPTS: u32 = 20;
pub const MAG_READY_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{device} timed out")]
    Timeout { device: &'static str },
    #[error("{device} read failed: {reason}")]
    Read { device: &'static str, reason: String },
    #[error("{device} initialization failed: {reason}")]
    Init { device: &'static str, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialSample {
    pub gyro_rad_s: Vector3<f64>,
    pub accel_g: Vector3<f64>,
}

pub trait InertialSensor: Send {
    fn read_inertial(&mut self) -> Result<InertialSample, SensorError>;
    /// `None` when the data-ready poll expires.
    fn read_magnetometer(&mut self) -> Result<Option<Vector3<f64>>, SensorError>;
    fn read_temperature(&mut self) -> Result<f64, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatteryReading {
    pub percent: Option<f64>,
    pub voltage_volts: Option<f64>,
}

pub trait PowerMonitor: Send {
    fn read_battery(&mut self) -> BatteryReading;
    /// Raw logic level of the external-power sense line.
    fn read_external_power_line(&mut self) -> Result<bool, SensorError>;
}

pub trait Camera: Send {
    fn capture(&mut self, request_id: &str, overlay: bool) -> Result<PathBuf, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentReading {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

pub trait EnvironmentSensor: Send {
    fn read(&mut self) -> EnvironmentReading;
}

/// Polls `ready` up to `attempts` times, sleeping `delay` between tries.
///
/// Blocks the calling thread. Agent ticks run on tokio's blocking pool, so
/// drivers may use this from `on_tick` but not from `on_message`.
pub fn poll_until_ready<F>(mut ready: F, attempts: u32, delay: Duration) -> bool
where
    F: FnMut() -> bool,
{
    for attempt in 0..attempts {
        if ready() {
            return true;
        }
        if attempt + 1 < attempts {
            std::thread::sleep(delay);
        }
    }
    false
}

// Simulated drivers used by the flight binary on a bench without hardware.

#[derive(Debug, Default)]
pub struct SimulatedImu {
    step: u64,
}

impl SimulatedImu {
    pub fn new() -> Self {
        Self::default()
    }

    fn mag_data_ready(&self) -> bool {
        self.step % 50 != 0
    }
}

impl InertialSensor for SimulatedImu {
    fn read_inertial(&mut self) -> Result<InertialSample, SensorError> {
        self.step += 1;
        let t = self.step as f64 * 0.1;
        Ok(InertialSample {
            gyro_rad_s: Vector3::new(0.002 * t.sin(), 0.002 * t.cos(), 0.0),
            accel_g: Vector3::new(0.01 * t.sin(), 0.01 * t.cos(), 1.0),
        })
    }

    fn read_magnetometer(&mut self) -> Result<Option<Vector3<f64>>, SensorError> {
        let ready = self.mag_data_ready();
        if !poll_until_ready(|| ready, MAG_READY_ATTEMPTS, MAG_READY_DELAY) {
            debug!("Magnetometer data-ready poll expired");
            return Ok(None);
        }
        Ok(Some(Vector3::new(22.0, 5.0, -42.0)))
    }

    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        Ok(24.0 + (self.step as f64 * 0.01).sin())
    }
}

#[derive(Debug)]
pub struct SimulatedPowerMonitor {
    percent: f64,
    drain_per_read: f64,
    external_power: bool,
}

impl SimulatedPowerMonitor {
    pub fn new(percent: f64, drain_per_read: f64, external_power: bool) -> Self {
        Self {
            percent,
            drain_per_read,
            external_power,
        }
    }

    pub fn set_external_power(&mut self, present: bool) {
        self.external_power = present;
    }
}

impl Default for SimulatedPowerMonitor {
    fn default() -> Self {
        Self::new(85.0, 0.2, false)
    }
}

impl PowerMonitor for SimulatedPowerMonitor {
    fn read_battery(&mut self) -> BatteryReading {
        if self.external_power {
            self.percent = (self.percent + 1.0).min(100.0);
        } else {
            self.percent = (self.percent - self.drain_per_read).max(0.0);
        }
        // Single-cell Li-ion, 3.3 V empty to 4.2 V full
        BatteryReading {
            percent: Some(self.percent),
            voltage_volts: Some(3.3 + 0.9 * self.percent / 100.0),
        }
    }

    fn read_external_power_line(&mut self) -> Result<bool, SensorError> {
        Ok(self.external_power)
    }
}

/// Writes a small placeholder JPEG per capture.
#[derive(Debug)]
pub struct SimulatedCamera {
    dir: PathBuf,
}

impl SimulatedCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Camera for SimulatedCamera {
    fn capture(&mut self, request_id: &str, overlay: bool) -> Result<PathBuf, SensorError> {
        std::fs::create_dir_all(&self.dir)?;

        let file_name: String = request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self.dir.join(format!("{file_name}.jpg"));

        let mut image = vec![0xFF, 0xD8, 0xFF, 0xE0];
        image.extend_from_slice(request_id.as_bytes());
        if overlay {
            image.extend_from_slice(b"OVERLAY");
        }
        image.extend(std::iter::repeat(0x55).take(512));
        image.extend_from_slice(&[0xFF, 0xD9]);

        std::fs::write(&path, &image).map_err(|e| {
            warn!(path = %path.display(), "Capture write failed: {}", e);
            SensorError::Io(e)
        })?;
        Ok(path)
    }
}

#[derive(Debug, Default)]
pub struct SimulatedEnvironment {
    step: u64,
}

impl SimulatedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvironmentSensor for SimulatedEnvironment {
    fn read(&mut self) -> EnvironmentReading {
        self.step += 1;
        let t = self.step as f64 * 0.05;
        EnvironmentReading {
            temperature_c: Some(21.5 + 2.0 * t.sin()),
            humidity_pct: Some(40.0 + 5.0 * t.cos()),
            pressure_hpa: Some(1013.0),
        }
    }
}
