use crate::state_machine::SatelliteMode;
use crate::telemetry::TelemetryRecord;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use crc::{Crc, CRC_16_IBM_3740};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// Largest payload accepted from the bus. Photo responses carry the encoded image.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
pub const MAX_REQUEST_ID_LEN: usize = 64;
pub const MAX_FRAME_PAYLOAD: usize = 200;

const_assert!(MAX_FRAME_PAYLOAD * 2 < MAX_MESSAGE_SIZE);

// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xorout
const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Packet integrity checksum used on downlink frames.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16_CCITT.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    ModeStatus,
    EpsStatus,
    AdcsStatus,
    PayloadStatus,
    PayloadData,
    PayloadPhoto,
    Command,
    CommandPhoto,
    Telemetry,
    CommDownlink,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::ModeStatus,
        Topic::EpsStatus,
        Topic::AdcsStatus,
        Topic::PayloadStatus,
        Topic::PayloadData,
        Topic::PayloadPhoto,
        Topic::Command,
        Topic::CommandPhoto,
        Topic::Telemetry,
        Topic::CommDownlink,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Topic::ModeStatus => "mode/status",
            Topic::EpsStatus => "eps/status",
            Topic::AdcsStatus => "adcs/status",
            Topic::PayloadStatus => "payload/status",
            Topic::PayloadData => "payload/data",
            Topic::PayloadPhoto => "payload/photo",
            Topic::Command => "command",
            Topic::CommandPhoto => "command/photo",
            Topic::Telemetry => "telemetry",
            Topic::CommDownlink => "comm/downlink",
        }
    }

    /// Publishers of "current known state" set the retain flag; commands never do.
    pub fn retained(self) -> bool {
        matches!(
            self,
            Topic::ModeStatus | Topic::EpsStatus | Topic::PayloadStatus | Topic::Telemetry
        )
    }

    pub fn path(self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.name().to_string()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), self.name())
        }
    }

    pub fn from_path(prefix: &str, path: &str) -> Option<Topic> {
        let name = if prefix.is_empty() {
            path
        } else {
            path.strip_prefix(prefix.trim_end_matches('/'))?
                .strip_prefix('/')?
        };
        Topic::ALL.iter().copied().find(|topic| topic.name() == name)
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3Reading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3Reading {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeStatus {
    pub state: SatelliteMode,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsStatus {
    pub timestamp: DateTime<Utc>,
    /// `None` is a sensor fault, distinct from a genuine 0%.
    pub battery_percent: Option<f64>,
    pub voltage_volts: Option<f64>,
    pub external_power: bool,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcsStatus {
    pub timestamp: DateTime<Utc>,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub imu_temp_c: Option<f64>,
    pub accel_g: Vector3Reading,
    pub gyro_dps: Vector3Reading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadState {
    Idle,
    Timelapse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadStatus {
    pub timestamp: DateTime<Utc>,
    pub state: PayloadState,
    pub photos_taken: u32,
    pub last_request_id: Option<String>,
    pub timelapse_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScienceSample {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PhotoResponse {
    Ok {
        request_id: String,
        path: String,
        size_bytes: u64,
        taken_at: DateTime<Utc>,
        /// Base64 encoded image bytes.
        payload: String,
    },
    Error {
        request_id: String,
        reason: String,
    },
}

impl PhotoResponse {
    pub fn request_id(&self) -> &str {
        match self {
            PhotoResponse::Ok { request_id, .. } | PhotoResponse::Error { request_id, .. } => {
                request_id
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PhotoResponse::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ScienceStart,
    ScienceStop,
    SafeMode,
    Recover,
    TimelapseStart,
    TimelapseStop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundCommand {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl GroundCommand {
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            request_id: None,
            interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhotoCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub overlay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkFrame {
    pub packet_id: String,
    pub index: u16,
    pub total: u16,
    pub crc16: u16,
    /// Base64 encoded chunk.
    pub data: String,
}

impl DownlinkFrame {
    pub fn new(packet_id: &str, index: u16, total: u16, chunk: &[u8]) -> Self {
        Self {
            packet_id: packet_id.to_string(),
            index,
            total,
            crc16: crc16(chunk),
            data: STANDARD.encode(chunk),
        }
    }

    pub fn chunk(&self) -> Result<Vec<u8>, ProtocolError> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ProtocolError::InvalidField(format!("frame data: {e}")))
    }

    pub fn verify(&self) -> bool {
        self.chunk().map(|bytes| crc16(&bytes) == self.crc16).unwrap_or(false)
    }
}

/// One variant per topic. Decoding validates shape and field ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Mode(ModeStatus),
    Eps(EpsStatus),
    Adcs(AdcsStatus),
    PayloadStatus(PayloadStatus),
    Science(ScienceSample),
    Photo(PhotoResponse),
    Command(GroundCommand),
    PhotoRequest(PhotoCommand),
    Telemetry(TelemetryRecord),
    Downlink(DownlinkFrame),
}

impl BusMessage {
    pub fn topic(&self) -> Topic {
        match self {
            BusMessage::Mode(_) => Topic::ModeStatus,
            BusMessage::Eps(_) => Topic::EpsStatus,
            BusMessage::Adcs(_) => Topic::AdcsStatus,
            BusMessage::PayloadStatus(_) => Topic::PayloadStatus,
            BusMessage::Science(_) => Topic::PayloadData,
            BusMessage::Photo(_) => Topic::PayloadPhoto,
            BusMessage::Command(_) => Topic::Command,
            BusMessage::PhotoRequest(_) => Topic::CommandPhoto,
            BusMessage::Telemetry(_) => Topic::Telemetry,
            BusMessage::Downlink(_) => Topic::CommDownlink,
        }
    }

    pub fn decode(topic: Topic, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload.len()));
        }

        let message = match topic {
            Topic::ModeStatus => BusMessage::Mode(parse(payload)?),
            Topic::EpsStatus => BusMessage::Eps(parse(payload)?),
            Topic::AdcsStatus => BusMessage::Adcs(parse(payload)?),
            Topic::PayloadStatus => BusMessage::PayloadStatus(parse(payload)?),
            Topic::PayloadData => BusMessage::Science(parse(payload)?),
            Topic::PayloadPhoto => BusMessage::Photo(parse(payload)?),
            Topic::Command => BusMessage::Command(parse(payload)?),
            Topic::CommandPhoto => BusMessage::PhotoRequest(parse(payload)?),
            Topic::Telemetry => BusMessage::Telemetry(parse(payload)?),
            Topic::CommDownlink => BusMessage::Downlink(parse(payload)?),
        };

        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            BusMessage::Mode(m) => serde_json::to_vec(m),
            BusMessage::Eps(m) => serde_json::to_vec(m),
            BusMessage::Adcs(m) => serde_json::to_vec(m),
            BusMessage::PayloadStatus(m) => serde_json::to_vec(m),
            BusMessage::Science(m) => serde_json::to_vec(m),
            BusMessage::Photo(m) => serde_json::to_vec(m),
            BusMessage::Command(m) => serde_json::to_vec(m),
            BusMessage::PhotoRequest(m) => serde_json::to_vec(m),
            BusMessage::Telemetry(m) => serde_json::to_vec(m),
            BusMessage::Downlink(m) => serde_json::to_vec(m),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            BusMessage::Eps(status) => {
                if let Some(percent) = status.battery_percent {
                    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
                        return Err(ProtocolError::InvalidField(format!(
                            "battery_percent out of range: {percent}"
                        )));
                    }
                }
                if status.voltage_volts.is_some_and(|v| !v.is_finite()) {
                    return Err(ProtocolError::InvalidField("voltage_volts".into()));
                }
            }
            BusMessage::Adcs(status) => {
                let angles_ok = status.roll_deg.is_finite()
                    && status.pitch_deg.is_finite()
                    && status.yaw_deg.is_finite();
                if !angles_ok || !status.accel_g.is_finite() || !status.gyro_dps.is_finite() {
                    return Err(ProtocolError::InvalidField("non-finite attitude".into()));
                }
            }
            BusMessage::Command(command) => {
                validate_request_id(command.request_id.as_deref())?;
                if command.interval_secs == Some(0) {
                    return Err(ProtocolError::InvalidField("interval_secs must be > 0".into()));
                }
            }
            BusMessage::PhotoRequest(request) => {
                validate_request_id(request.request_id.as_deref())?;
            }
            BusMessage::Photo(response) => {
                validate_request_id(Some(response.request_id()))?;
            }
            BusMessage::Downlink(frame) => {
                if frame.total == 0 || frame.index >= frame.total {
                    return Err(ProtocolError::InvalidField(format!(
                        "frame index {} of {}",
                        frame.index, frame.total
                    )));
                }
            }
            BusMessage::Mode(_)
            | BusMessage::PayloadStatus(_)
            | BusMessage::Science(_)
            | BusMessage::Telemetry(_) => {}
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

fn validate_request_id(request_id: Option<&str>) -> Result<(), ProtocolError> {
    match request_id {
        Some(id) if id.is_empty() || id.len() > MAX_REQUEST_ID_LEN => Err(
            ProtocolError::InvalidField(format!("request_id length {}", id.len())),
        ),
        _ => Ok(()),
    }
}

/// A message ready for the broker: resolved topic, encoded body and retain flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Outbound {
    pub fn from_message(message: &BusMessage) -> Result<Self, ProtocolError> {
        let topic = message.topic();
        Ok(Self {
            topic,
            payload: message.encode()?,
            retain: topic.retained(),
        })
    }

    pub fn decode(&self) -> Result<BusMessage, ProtocolError> {
        BusMessage::decode(self.topic, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}
