use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BROKER_HOST: &str = "localhost";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "cubesat";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
    pub client_name: String,
    /// Distinguishes several satellites sharing one broker.
    pub instance_id: Option<String>,
    /// Persistent sessions need a client id that survives restarts.
    pub persistent_session: bool,
    pub keep_alive_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    pub connect_timeout_secs: u64,
    /// Keep retrying when the first connection fails instead of exiting.
    pub retry_initial_connect: bool,
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_name: "cubesat".to_string(),
            instance_id: None,
            persistent_session: true,
            keep_alive_secs: 60,
            reconnect_min_secs: 1,
            reconnect_max_secs: 120,
            connect_timeout_secs: 10,
            retry_initial_connect: false,
            channel_capacity: 64,
        }
    }
}

impl BusConfig {
    pub fn with_client_name(&self, name: &str) -> Self {
        Self {
            client_name: name.to_string(),
            ..self.clone()
        }
    }

    /// Ephemeral clients get a clean session and a per-process id.
    pub fn ephemeral(&self, name: &str) -> Self {
        Self {
            client_name: name.to_string(),
            persistent_session: false,
            ..self.clone()
        }
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub eps_secs: u64,
    pub adcs_millis: u64,
    pub science_secs: u64,
    pub telemetry_secs: u64,
    pub low_power_telemetry_secs: u64,
    pub deploy_secs: u64,
    pub restore_window_millis: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            eps_secs: 30,
            adcs_millis: 1000,
            science_secs: 60,
            telemetry_secs: 30,
            low_power_telemetry_secs: 300,
            deploy_secs: 10,
            restore_window_millis: 2000,
        }
    }
}

impl IntervalConfig {
    pub fn eps(&self) -> Duration {
        Duration::from_secs(self.eps_secs)
    }

    pub fn adcs(&self) -> Duration {
        Duration::from_millis(self.adcs_millis)
    }

    pub fn science(&self) -> Duration {
        Duration::from_secs(self.science_secs)
    }

    pub fn telemetry(&self) -> Duration {
        Duration::from_secs(self.telemetry_secs)
    }

    pub fn low_power_telemetry(&self) -> Duration {
        Duration::from_secs(self.low_power_telemetry_secs)
    }

    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }

    pub fn restore_window(&self) -> Duration {
        Duration::from_millis(self.restore_window_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub photo_dir: PathBuf,
    pub telemetry_log: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self::rooted_at(PathBuf::from("data"))
    }
}

impl PathConfig {
    pub fn rooted_at(data_dir: PathBuf) -> Self {
        Self {
            photo_dir: data_dir.join("photos"),
            telemetry_log: data_dir.join("telemetry_log.csv"),
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AhrsConfig {
    pub kp: f64,
    pub ki: f64,
}

impl Default for AhrsConfig {
    fn default() -> Self {
        Self { kp: 4.5, ki: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalPowerPolarity {
    /// Logic high on the sense line means external power is present.
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl ExternalPowerPolarity {
    pub fn interpret(self, line_high: bool) -> bool {
        match self {
            ExternalPowerPolarity::ActiveHigh => line_high,
            ExternalPowerPolarity::ActiveLow => !line_high,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EpsConfig {
    pub polarity: ExternalPowerPolarity,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    pub bus: BusConfig,
    pub intervals: IntervalConfig,
    pub paths: PathConfig,
    pub ahrs: AhrsConfig,
    pub eps: EpsConfig,
}

impl FlightConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `MQTT_BROKER`, `MQTT_PORT`, `CUBESAT_TOPIC_PREFIX`, `CUBESAT_INSTANCE_ID`
    /// and `CUBESAT_DATA_DIR`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER") {
            self.bus.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.bus.port = port.parse().map_err(|_| ConfigError::Env {
                name: "MQTT_PORT",
                value: port,
            })?;
        }
        if let Some(prefix) = lookup("CUBESAT_TOPIC_PREFIX") {
            self.bus.topic_prefix = prefix;
        }
        if let Some(instance) = lookup("CUBESAT_INSTANCE_ID").filter(|id| !id.is_empty()) {
            self.bus.instance_id = Some(instance);
        }
        if let Some(dir) = lookup("CUBESAT_DATA_DIR") {
            self.paths = PathConfig::rooted_at(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.host.is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".into()));
        }
        if self.bus.reconnect_min_secs == 0 || self.bus.reconnect_min_secs > self.bus.reconnect_max_secs {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < min <= max".into(),
            ));
        }
        let iv = &self.intervals;
        if iv.eps_secs == 0 || iv.adcs_millis == 0 || iv.science_secs == 0 || iv.telemetry_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        if iv.low_power_telemetry_secs < iv.telemetry_secs {
            return Err(ConfigError::Invalid(
                "low-power telemetry interval shorter than nominal".into(),
            ));
        }
        if !(self.ahrs.kp.is_finite() && self.ahrs.ki.is_finite()) {
            return Err(ConfigError::Invalid("AHRS gains must be finite".into()));
        }
        Ok(())
    }
}
