use super::{FlightAgent, SubsystemId};
use crate::protocol::{BusMessage, EpsStatus, GroundCommand, Topic};
use crate::state_machine::{ObcStateMachine, SatelliteMode};
use heapless::Deque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const OBC_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Ground commands held while waiting for the retained mode.
pub const MAX_HELD_COMMANDS: usize = 8;

pub type SelfTest = Box<dyn FnMut() -> bool + Send>;

/// Bus-facing wrapper around [`ObcStateMachine`].
///
/// After connecting it waits `restore_window` for its own retained mode; if
/// one arrives the mode is adopted, otherwise the boot sequence runs. EPS
/// reports and commands seen during the window are held and applied once the
/// mode is settled, since retained topics arrive in no particular order.
pub struct ObcAgent {
    machine: ObcStateMachine,
    restore_window: Duration,
    heartbeat_interval: Duration,
    started_at: Option<Instant>,
    booted: bool,
    last_heartbeat: Option<Instant>,
    self_test: SelfTest,
    held_eps: Option<EpsStatus>,
    held_commands: Deque<GroundCommand, MAX_HELD_COMMANDS>,
}

impl ObcAgent {
    pub fn new(deploy_duration: Duration, restore_window: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            machine: ObcStateMachine::new(deploy_duration),
            restore_window,
            heartbeat_interval,
            started_at: None,
            booted: false,
            last_heartbeat: None,
            self_test: Box::new(|| true),
            held_eps: None,
            held_commands: Deque::new(),
        }
    }

    pub fn with_self_test<F>(mut self, self_test: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.self_test = Box::new(self_test);
        self
    }

    pub fn current_mode(&self) -> SatelliteMode {
        self.machine.current_mode()
    }

    pub fn machine(&self) -> &ObcStateMachine {
        &self.machine
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    fn boot(&mut self, now: Instant) {
        if self.booted {
            return;
        }
        let ok = (self.self_test)();
        self.machine.start(ok, now);
        self.booted = true;
        self.last_heartbeat = Some(now);
    }

    /// Adopts a retained mode. A retained `Boot` means the previous run never
    /// finished booting, so the boot sequence runs instead.
    fn restore(&mut self, mode: SatelliteMode, now: Instant) {
        if !self.machine.restore(mode, now) {
            info!("Rerunning boot sequence");
            self.boot(now);
            return;
        }
        self.booted = true;
        self.last_heartbeat = Some(now);
    }

    fn hold_command(&mut self, command: GroundCommand) {
        if self.held_commands.is_full() {
            warn!("Too many commands before boot, dropping oldest");
            self.held_commands.pop_front();
        }
        let _ = self.held_commands.push_back(command);
    }

    /// Applies whatever arrived before the mode was settled, in arrival order
    /// per topic. The latest EPS report supersedes earlier ones.
    fn replay_held(&mut self) {
        if let Some(status) = self.held_eps.take() {
            self.machine.handle_eps_report(&status);
        }
        while let Some(command) = self.held_commands.pop_front() {
            self.machine
                .handle_command(command.command, command.request_id.as_deref());
        }
    }

    fn drain(&mut self) -> Vec<BusMessage> {
        self.machine
            .take_outbox()
            .into_iter()
            .map(BusMessage::Mode)
            .collect()
    }
}

impl FlightAgent for ObcAgent {
    fn id(&self) -> SubsystemId {
        SubsystemId::Obc
    }

    fn subscriptions(&self) -> &'static [Topic] {
        &[Topic::ModeStatus, Topic::EpsStatus, Topic::Command]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(OBC_POLL_INTERVAL)
    }

    fn on_start(&mut self, now: Instant) -> Vec<BusMessage> {
        self.started_at = Some(now);
        Vec::new()
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage> {
        let now = Instant::now();
        match message {
            BusMessage::Mode(status) => {
                if self.booted {
                    // Our own retained publication echoed back
                    return Vec::new();
                }
                info!(mode = %status.state, "Found retained mode");
                self.restore(status.state, now);
                self.replay_held();
            }
            BusMessage::Eps(status) if !self.booted => {
                debug!("Holding EPS report until mode is settled");
                self.held_eps = Some(status);
            }
            BusMessage::Eps(status) => {
                self.machine.handle_eps_report(&status);
            }
            BusMessage::Command(command) if !self.booted => {
                info!(command = ?command.command, "Holding command until mode is settled");
                self.hold_command(command);
            }
            BusMessage::Command(command) => {
                self.machine
                    .handle_command(command.command, command.request_id.as_deref());
            }
            other => debug!(topic = %other.topic(), "OBC ignoring message"),
        }
        self.drain()
    }

    fn on_tick(&mut self, now: Instant) -> Vec<BusMessage> {
        if !self.booted {
            let started = *self.started_at.get_or_insert(now);
            if now.saturating_duration_since(started) >= self.restore_window {
                info!("No retained mode found, booting");
                self.boot(now);
                self.replay_held();
            }
            return self.drain();
        }

        self.machine.tick(now);

        let due = self
            .last_heartbeat
            .map_or(true, |last| now.saturating_duration_since(last) >= self.heartbeat_interval);
        if due {
            self.machine.publish_mode();
            self.last_heartbeat = Some(now);
        }

        self.drain()
    }
}
