pub mod adcs;
pub mod comms;
pub mod eps;
pub mod obc;
pub mod payload;

pub use adcs::AdcsAgent;
pub use comms::CommsRelay;
pub use eps::EpsAgent;
pub use obc::ObcAgent;
pub use payload::PayloadAgent;

use crate::bus::BusHandle;
use crate::protocol::{BusMessage, Topic};
use crate::state_machine::SatelliteMode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemId {
    Obc,
    Eps,
    Adcs,
    Payload,
    Telemetry,
    Comms,
}

impl SubsystemId {
    pub const ALL: [SubsystemId; 6] = [
        SubsystemId::Obc,
        SubsystemId::Eps,
        SubsystemId::Adcs,
        SubsystemId::Payload,
        SubsystemId::Telemetry,
        SubsystemId::Comms,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SubsystemId::Obc => "obc",
            SubsystemId::Eps => "eps",
            SubsystemId::Adcs => "adcs",
            SubsystemId::Payload => "payload",
            SubsystemId::Telemetry => "telemetry",
            SubsystemId::Comms => "comms",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.name() == name)
    }
}

/// Read-only copy of the satellite mode as last seen on the retained mode topic.
///
/// Shared between an agent and its background tasks; the OBC owns the real value.
#[derive(Debug, Clone, Default)]
pub struct ModeCache(Arc<RwLock<Option<SatelliteMode>>>);

impl ModeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<SatelliteMode> {
        match self.0.read() {
            Ok(mode) => *mode,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, mode: SatelliteMode) {
        match self.0.write() {
            Ok(mut slot) => *slot = Some(mode),
            Err(poisoned) => *poisoned.into_inner() = Some(mode),
        }
    }

    /// Updates the cache from a mode message. Returns true if the message was one.
    pub fn observe(&self, message: &BusMessage) -> bool {
        if let BusMessage::Mode(status) = message {
            if self.get() != Some(status.state) {
                debug!(mode = %status.state, "Cached mode updated");
            }
            self.set(status.state);
            true
        } else {
            false
        }
    }
}

/// One flight agent. The runner owns it exclusively and calls these from a
/// single task, interleaving bus deliveries with the periodic tick.
pub trait FlightAgent: Send {
    fn id(&self) -> SubsystemId;

    fn subscriptions(&self) -> &'static [Topic];

    /// `None` for purely reactive agents. Re-read after every tick.
    fn tick_interval(&self) -> Option<Duration>;

    /// Called once the bus is connected, before any message or tick.
    fn attach(&mut self, _bus: BusHandle) {}

    fn on_start(&mut self, _now: Instant) -> Vec<BusMessage> {
        Vec::new()
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage>;

    /// Runs on the blocking pool; sensor reads here may block briefly.
    fn on_tick(&mut self, now: Instant) -> Vec<BusMessage>;

    fn on_shutdown(&mut self) {}
}
