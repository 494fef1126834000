use super::{FlightAgent, ModeCache, SubsystemId};
use crate::config::ExternalPowerPolarity;
use crate::protocol::{BusMessage, EpsStatus, Health, Topic};
use crate::sensors::PowerMonitor;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct EpsAgent {
    monitor: Box<dyn PowerMonitor>,
    polarity: ExternalPowerPolarity,
    interval: Duration,
    mode: ModeCache,
    last_status: Option<EpsStatus>,
}

impl EpsAgent {
    pub fn new(
        monitor: Box<dyn PowerMonitor>,
        polarity: ExternalPowerPolarity,
        interval: Duration,
    ) -> Self {
        Self {
            monitor,
            polarity,
            interval,
            mode: ModeCache::new(),
            last_status: None,
        }
    }

    /// One polling cycle. Missing readings stay absent and mark the report unhealthy.
    pub fn sample(&mut self) -> EpsStatus {
        let battery = self.monitor.read_battery();
        let battery_percent = battery
            .percent
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0));
        let voltage_volts = battery.voltage_volts.filter(|v| v.is_finite());

        let (external_power, line_ok) = match self.monitor.read_external_power_line() {
            Ok(level) => (self.polarity.interpret(level), true),
            Err(e) => {
                warn!("External power line unreadable: {}", e);
                (false, false)
            }
        };

        let health = if line_ok && battery_percent.is_some() && voltage_volts.is_some() {
            Health::Ok
        } else {
            Health::Error
        };

        let status = EpsStatus {
            timestamp: Utc::now(),
            battery_percent,
            voltage_volts,
            external_power,
            health,
        };
        debug!(?battery_percent, external_power, ?health, "EPS sample");
        self.last_status = Some(status.clone());
        status
    }

    pub fn get_state(&self) -> Option<&EpsStatus> {
        self.last_status.as_ref()
    }

    pub fn cached_mode(&self) -> &ModeCache {
        &self.mode
    }
}

impl FlightAgent for EpsAgent {
    fn id(&self) -> SubsystemId {
        SubsystemId::Eps
    }

    fn subscriptions(&self) -> &'static [Topic] {
        &[Topic::ModeStatus]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn on_start(&mut self, _now: Instant) -> Vec<BusMessage> {
        vec![BusMessage::Eps(self.sample())]
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage> {
        self.mode.observe(&message);
        Vec::new()
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<BusMessage> {
        vec![BusMessage::Eps(self.sample())]
    }
}
