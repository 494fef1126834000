use crate::metrics::{HostMetrics, HostMetricsSource};
use crate::protocol::{AdcsStatus, BusMessage, EpsStatus, PayloadStatus, ScienceSample, Topic};
use crate::state_machine::SatelliteMode;
use crate::subsystems::{FlightAgent, SubsystemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("telemetry log I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry log CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("telemetry snapshot encoding: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("telemetry log {path} has incompatible header {found:?}")]
    Schema { path: PathBuf, found: Vec<String> },
}

/// One merged snapshot of every subsystem plus the host computer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub obc_state: Option<SatelliteMode>,
    pub eps: Option<EpsStatus>,
    pub adcs: Option<AdcsStatus>,
    pub payload: Option<PayloadStatus>,
    pub science: Option<ScienceSample>,
    pub system: HostMetrics,
}

/// Latest payload per subsystem. One producer per slot, last write wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestCache {
    pub mode: Option<SatelliteMode>,
    pub eps: Option<EpsStatus>,
    pub adcs: Option<AdcsStatus>,
    pub payload: Option<PayloadStatus>,
    pub science: Option<ScienceSample>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub messages_ingested: u64,
    pub records_produced: u64,
}

#[derive(Debug)]
pub struct TelemetryAggregator {
    cache: LatestCache,
    interval: Duration,
    low_power_interval: Duration,
    stats: AggregatorStats,
}

impl TelemetryAggregator {
    pub fn new(interval: Duration, low_power_interval: Duration) -> Self {
        Self {
            cache: LatestCache::default(),
            interval,
            low_power_interval,
            stats: AggregatorStats::default(),
        }
    }

    /// Stores the message in its slot. Returns false for topics the aggregator ignores.
    pub fn ingest(&mut self, message: &BusMessage) -> bool {
        match message {
            BusMessage::Mode(status) => self.cache.mode = Some(status.state),
            BusMessage::Eps(status) => self.cache.eps = Some(status.clone()),
            BusMessage::Adcs(status) => self.cache.adcs = Some(status.clone()),
            BusMessage::PayloadStatus(status) => self.cache.payload = Some(status.clone()),
            BusMessage::Science(sample) => self.cache.science = Some(sample.clone()),
            _ => return false,
        }
        self.stats.messages_ingested += 1;
        true
    }

    pub fn cache(&self) -> &LatestCache {
        &self.cache
    }

    pub fn get_stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Longer cycle while the satellite is conserving power.
    pub fn current_interval(&self) -> Duration {
        match self.cache.mode {
            Some(mode) if mode.is_protective() => self.low_power_interval,
            _ => self.interval,
        }
    }

    /// Pure merge of the cache and host metrics; only `timestamp` varies between calls.
    pub fn aggregate(&mut self, timestamp: DateTime<Utc>, system: HostMetrics) -> TelemetryRecord {
        self.stats.records_produced += 1;
        TelemetryRecord {
            timestamp,
            obc_state: self.cache.mode,
            eps: self.cache.eps.clone(),
            adcs: self.cache.adcs.clone(),
            payload: self.cache.payload.clone(),
            science: self.cache.science.clone(),
            system,
        }
    }
}

pub trait TelemetrySink: Send {
    /// Appends one row and returns its sequence id.
    fn append(&mut self, record: &TelemetryRecord) -> Result<u64, StoreError>;
}

pub const TELEMETRY_LOG_COLUMNS: [&str; 21] = [
    "id",
    "timestamp",
    "battery_percent",
    "voltage_volts",
    "external_power",
    "roll_deg",
    "pitch_deg",
    "yaw_deg",
    "imu_temp_c",
    "temperature_c",
    "humidity_pct",
    "pressure_hpa",
    "cpu_percent",
    "ram_percent",
    "swap_percent",
    "disk_percent",
    "uptime_seconds",
    "cpu_temp_c",
    "gpu_temp_c",
    "obc_state",
    "raw_json",
];

#[derive(Debug, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub id: u64,
    pub timestamp: String,
    pub battery_percent: Option<f64>,
    pub voltage_volts: Option<f64>,
    pub external_power: Option<bool>,
    pub roll_deg: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub yaw_deg: Option<f64>,
    pub imu_temp_c: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub swap_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: u64,
    pub cpu_temp_c: Option<f64>,
    pub gpu_temp_c: Option<f64>,
    pub obc_state: Option<String>,
    pub raw_json: String,
}

impl TelemetryRow {
    pub fn from_record(id: u64, record: &TelemetryRecord) -> Result<Self, StoreError> {
        let eps = record.eps.as_ref();
        let adcs = record.adcs.as_ref();
        let science = record.science.as_ref();

        Ok(Self {
            id,
            timestamp: record.timestamp.to_rfc3339(),
            battery_percent: eps.and_then(|s| s.battery_percent),
            voltage_volts: eps.and_then(|s| s.voltage_volts),
            external_power: eps.map(|s| s.external_power),
            roll_deg: adcs.map(|s| s.roll_deg),
            pitch_deg: adcs.map(|s| s.pitch_deg),
            yaw_deg: adcs.map(|s| s.yaw_deg),
            imu_temp_c: adcs.and_then(|s| s.imu_temp_c),
            temperature_c: science.and_then(|s| s.temperature_c),
            humidity_pct: science.and_then(|s| s.humidity_pct),
            pressure_hpa: science.and_then(|s| s.pressure_hpa),
            cpu_percent: record.system.cpu_percent,
            ram_percent: record.system.ram_percent,
            swap_percent: record.system.swap_percent,
            disk_percent: record.system.disk_percent,
            uptime_seconds: record.system.uptime_seconds,
            cpu_temp_c: record.system.cpu_temp_c,
            gpu_temp_c: record.system.gpu_temp_c,
            obc_state: record.obc_state.map(|mode| mode.to_string()),
            raw_json: serde_json::to_string(record)?,
        })
    }
}

/// Append-only CSV log. Rows are never rewritten; ids continue across reopen.
pub struct CsvTelemetryLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    next_id: u64,
}

impl CsvTelemetryLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let existing = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let next_id = if existing {
            check_header(&path)?;
            last_id(&path)? + 1
        } else {
            1
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if existing && !ends_with_newline(&mut file)? {
            warn!(path = %path.display(), "Telemetry log ends in a torn row, terminating it");
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if !existing {
            writer.write_record(TELEMETRY_LOG_COLUMNS)?;
            writer.flush()?;
        }

        info!(path = %path.display(), next_id, "Telemetry log opened");
        Ok(Self {
            path,
            writer,
            next_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

impl TelemetrySink for CsvTelemetryLog {
    fn append(&mut self, record: &TelemetryRecord) -> Result<u64, StoreError> {
        let id = self.next_id;
        let row = TelemetryRow::from_record(id, record)?;
        self.writer.serialize(&row)?;
        self.writer.flush()?;
        self.next_id += 1;
        debug!(id, "Telemetry row appended");
        Ok(id)
    }
}

/// Columns only ever get appended, so an older log's header must be a prefix
/// of the current one.
fn check_header(path: &Path) -> Result<(), StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let found: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let compatible = !found.is_empty()
        && found.len() <= TELEMETRY_LOG_COLUMNS.len()
        && found
            .iter()
            .zip(TELEMETRY_LOG_COLUMNS)
            .all(|(have, want)| have == want);
    if compatible {
        Ok(())
    } else {
        Err(StoreError::Schema {
            path: path.to_path_buf(),
            found,
        })
    }
}

fn ends_with_newline(file: &mut File) -> Result<bool, StoreError> {
    if file.seek(SeekFrom::End(0))? == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Highest id in an existing log. Unparseable rows (torn writes) are skipped.
fn last_id(path: &Path) -> Result<u64, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut last = 0;
    for record in reader.records() {
        match record {
            Ok(record) => {
                if let Some(id) = record.get(0).and_then(|id| id.parse::<u64>().ok()) {
                    last = last.max(id);
                }
            }
            Err(e) => warn!("Skipping unreadable telemetry row: {}", e),
        }
    }
    Ok(last)
}

/// Aggregator wired to the bus: caches every status topic, then on each cycle
/// publishes the merged record and appends it to the sink.
pub struct TelemetryAgent {
    aggregator: TelemetryAggregator,
    metrics: Box<dyn HostMetricsSource>,
    sink: Box<dyn TelemetrySink>,
    store_failures: u64,
}

impl TelemetryAgent {
    pub fn new(
        aggregator: TelemetryAggregator,
        metrics: Box<dyn HostMetricsSource>,
        sink: Box<dyn TelemetrySink>,
    ) -> Self {
        Self {
            aggregator,
            metrics,
            sink,
            store_failures: 0,
        }
    }

    pub fn aggregator(&self) -> &TelemetryAggregator {
        &self.aggregator
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures
    }

    pub fn collect(&mut self, timestamp: DateTime<Utc>) -> TelemetryRecord {
        let system = self.metrics.collect();
        let record = self.aggregator.aggregate(timestamp, system);
        if let Err(e) = self.sink.append(&record) {
            self.store_failures += 1;
            error!("Telemetry append failed: {}", e);
        }
        record
    }
}

impl FlightAgent for TelemetryAgent {
    fn id(&self) -> SubsystemId {
        SubsystemId::Telemetry
    }

    fn subscriptions(&self) -> &'static [Topic] {
        &[
            Topic::ModeStatus,
            Topic::EpsStatus,
            Topic::AdcsStatus,
            Topic::PayloadStatus,
            Topic::PayloadData,
        ]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.aggregator.current_interval())
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage> {
        if !self.aggregator.ingest(&message) {
            debug!(topic = %message.topic(), "Telemetry ignoring message");
        }
        Vec::new()
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<BusMessage> {
        vec![BusMessage::Telemetry(self.collect(Utc::now()))]
    }
}
