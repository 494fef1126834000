//! # CubeSat Flight Software
//!
//! Onboard agents (OBC, EPS, ADCS, Payload, Telemetry, Comms) that coordinate
//! exclusively over an MQTT publish/subscribe bus, plus the logic deciding
//! which satellite-wide operating mode is active.
//!
//! ## Features
//!
//! - **Bus contract**: fixed topics, QoS 1, retained state topics, tagged and validated payloads
//! - **Mode arbitration**: table-driven OBC state machine with battery priority rules
//! - **Guarded actions**: agents re-check the cached mode before restricted actions
//! - **Attitude estimation**: per-instance Mahony filter over a unit quaternion
//! - **Telemetry**: latest-value cache merged with host metrics into an append-only log
//!
//! ## Quick Start
//!
//! ```rust
//! use cubesat_flight::protocol::{CommandKind, EpsStatus, Health};
//! use cubesat_flight::state_machine::{ObcStateMachine, SatelliteMode};
//! use std::time::{Duration, Instant};
//!
//! let mut obc = ObcStateMachine::new(Duration::from_secs(10));
//! let now = Instant::now();
//! obc.start(true, now);
//! obc.tick(now + Duration::from_secs(10));
//! assert_eq!(obc.current_mode(), SatelliteMode::Nominal);
//!
//! let report = EpsStatus {
//!     timestamp: chrono::Utc::now(),
//!     battery_percent: Some(10.0),
//!     voltage_volts: Some(3.4),
//!     external_power: false,
//!     health: Health::Ok,
//! };
//! obc.handle_eps_report(&report);
//! assert_eq!(obc.current_mode(), SatelliteMode::Safe);
//!
//! obc.handle_command(CommandKind::Recover, None);
//! assert_eq!(obc.current_mode(), SatelliteMode::Nominal);
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Topics, payload schemas, validation and CRC-16
//! - [`bus`] - Broker connection with backoff and resubscription
//! - [`state_machine`] - Authoritative satellite mode
//! - [`subsystems`] - EPS, ADCS, Payload, OBC and Comms agents
//! - [`ahrs`] - Attitude filter
//! - [`telemetry`] - Aggregation and the persistent log
//! - [`agent`] - Event loop driving one agent

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod agent;
pub mod ahrs;
pub mod bus;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod sensors;
pub mod state_machine;
pub mod subsystems;
pub mod telemetry;

pub use agent::{run_agent, AgentError};
pub use ahrs::AttitudeEstimator;
pub use config::FlightConfig;
pub use protocol::{crc16, BusMessage, Topic};
pub use state_machine::{ObcStateMachine, SatelliteMode};
pub use telemetry::{CsvTelemetryLog, TelemetryAggregator, TelemetryRecord};
