use crate::protocol::{CommandKind, EpsStatus, ModeStatus};
use chrono::{DateTime, Utc};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MAX_TRANSITION_HISTORY: usize = 32;

/// Below this the satellite is forced into safe mode from anywhere.
pub const SAFE_BATTERY_PERCENT: u8 = 20;
/// Below this the satellite sheds load, unless already in a protective mode.
pub const LOW_POWER_BATTERY_PERCENT: u8 = 40;

const_assert!(SAFE_BATTERY_PERCENT < LOW_POWER_BATTERY_PERCENT);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SatelliteMode {
    Boot,
    Deploy,
    Nominal,
    Science,
    LowPower,
    Safe,
}

impl SatelliteMode {
    pub const ALL: [SatelliteMode; 6] = [
        SatelliteMode::Boot,
        SatelliteMode::Deploy,
        SatelliteMode::Nominal,
        SatelliteMode::Science,
        SatelliteMode::LowPower,
        SatelliteMode::Safe,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SatelliteMode::Boot => "Boot",
            SatelliteMode::Deploy => "Deploy",
            SatelliteMode::Nominal => "Nominal",
            SatelliteMode::Science => "Science",
            SatelliteMode::LowPower => "LowPower",
            SatelliteMode::Safe => "Safe",
        }
    }

    pub fn is_protective(self) -> bool {
        matches!(self, SatelliteMode::LowPower | SatelliteMode::Safe)
    }
}

impl core::fmt::Display for SatelliteMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    AutoDeploy,
    DeploymentComplete,
    StartScience,
    EndScience,
    EnterLowPower,
    EnterSafeMode,
    Recover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceModes {
    Any,
    Only(&'static [SatelliteMode]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub trigger: Trigger,
    pub sources: SourceModes,
    pub destination: SatelliteMode,
}

impl ModeTransition {
    pub fn allows(&self, mode: SatelliteMode) -> bool {
        match self.sources {
            SourceModes::Any => true,
            SourceModes::Only(modes) => modes.contains(&mode),
        }
    }
}

pub const TRANSITIONS: [ModeTransition; 7] = [
    ModeTransition {
        trigger: Trigger::AutoDeploy,
        sources: SourceModes::Only(&[SatelliteMode::Boot]),
        destination: SatelliteMode::Deploy,
    },
    ModeTransition {
        trigger: Trigger::DeploymentComplete,
        sources: SourceModes::Only(&[SatelliteMode::Deploy]),
        destination: SatelliteMode::Nominal,
    },
    ModeTransition {
        trigger: Trigger::StartScience,
        sources: SourceModes::Only(&[SatelliteMode::Nominal]),
        destination: SatelliteMode::Science,
    },
    ModeTransition {
        trigger: Trigger::EndScience,
        sources: SourceModes::Only(&[SatelliteMode::Science]),
        destination: SatelliteMode::Nominal,
    },
    ModeTransition {
        trigger: Trigger::EnterLowPower,
        sources: SourceModes::Only(&[
            SatelliteMode::Nominal,
            SatelliteMode::Science,
            SatelliteMode::Deploy,
        ]),
        destination: SatelliteMode::LowPower,
    },
    ModeTransition {
        trigger: Trigger::EnterSafeMode,
        sources: SourceModes::Any,
        destination: SatelliteMode::Safe,
    },
    ModeTransition {
        trigger: Trigger::Recover,
        sources: SourceModes::Only(&[SatelliteMode::LowPower, SatelliteMode::Safe]),
        destination: SatelliteMode::Nominal,
    },
];

impl Trigger {
    pub fn transition(self) -> &'static ModeTransition {
        // Every trigger has exactly one row
        match self {
            Trigger::AutoDeploy => &TRANSITIONS[0],
            Trigger::DeploymentComplete => &TRANSITIONS[1],
            Trigger::StartScience => &TRANSITIONS[2],
            Trigger::EndScience => &TRANSITIONS[3],
            Trigger::EnterLowPower => &TRANSITIONS[4],
            Trigger::EnterSafeMode => &TRANSITIONS[5],
            Trigger::Recover => &TRANSITIONS[6],
        }
    }

    /// Ground command mapped onto a mode trigger. Payload-only commands have none.
    pub fn from_command(command: CommandKind) -> Option<Trigger> {
        match command {
            CommandKind::ScienceStart => Some(Trigger::StartScience),
            CommandKind::ScienceStop => Some(Trigger::EndScience),
            CommandKind::SafeMode => Some(Trigger::EnterSafeMode),
            CommandKind::Recover => Some(Trigger::Recover),
            CommandKind::TimelapseStart | CommandKind::TimelapseStop => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub trigger: Trigger,
    pub from: SatelliteMode,
    pub to: SatelliteMode,
    pub timestamp: DateTime<Utc>,
}

/// Authoritative owner of the satellite mode.
///
/// Every entry into a mode queues a [`ModeStatus`] in the outbox; the caller
/// drains it with [`ObcStateMachine::take_outbox`] and publishes it retained.
#[derive(Debug)]
pub struct ObcStateMachine {
    mode: SatelliteMode,
    history: Vec<TransitionRecord, MAX_TRANSITION_HISTORY>,
    outbox: std::vec::Vec<ModeStatus>,
    deploy_duration: Duration,
    deploy_started: Option<Instant>,
}

impl ObcStateMachine {
    pub fn new(deploy_duration: Duration) -> Self {
        Self {
            mode: SatelliteMode::Boot,
            history: Vec::new(),
            outbox: std::vec::Vec::new(),
            deploy_duration,
            deploy_started: None,
        }
    }

    pub fn current_mode(&self) -> SatelliteMode {
        self.mode
    }

    /// Announces `Boot`, then advances on the self-test outcome.
    pub fn start(&mut self, self_test_ok: bool, now: Instant) {
        info!("🛰️  OBC booting");
        self.publish_mode();

        if self_test_ok {
            if self.fire(Trigger::AutoDeploy).is_some() {
                self.deploy_started = Some(now);
            }
        } else {
            error!("Self-test failed, entering safe mode");
            self.fire(Trigger::EnterSafeMode);
        }
    }

    /// Adopt a mode recovered from the retained mode topic after a restart.
    ///
    /// `Boot` is refused: nothing would ever advance it, so the caller runs
    /// [`start`](Self::start) instead. Returns whether the mode was adopted.
    pub fn restore(&mut self, mode: SatelliteMode, now: Instant) -> bool {
        if mode == SatelliteMode::Boot {
            warn!("Retained mode is Boot, not restoring");
            return false;
        }
        info!(%mode, "Restoring mode from retained state");
        self.mode = mode;
        self.deploy_started = (mode == SatelliteMode::Deploy).then_some(now);
        self.publish_mode();
        true
    }

    /// Completes deployment once the deploy window has elapsed.
    pub fn tick(&mut self, now: Instant) -> Option<SatelliteMode> {
        let started = self.deploy_started?;
        if self.mode != SatelliteMode::Deploy {
            self.deploy_started = None;
            return None;
        }
        if now.saturating_duration_since(started) >= self.deploy_duration {
            self.deploy_started = None;
            return self.fire(Trigger::DeploymentComplete);
        }
        None
    }

    /// Applies the power rules, highest priority first. Returns the new mode if one was entered.
    pub fn handle_eps_report(&mut self, status: &EpsStatus) -> Option<SatelliteMode> {
        if let Some(percent) = status.battery_percent {
            if percent < f64::from(SAFE_BATTERY_PERCENT) {
                if self.mode == SatelliteMode::Safe {
                    return None;
                }
                warn!(battery_percent = percent, "Battery critical");
                return self.fire(Trigger::EnterSafeMode);
            }

            if percent < f64::from(LOW_POWER_BATTERY_PERCENT) && !self.mode.is_protective() {
                warn!(battery_percent = percent, "Battery low");
                return self.fire(Trigger::EnterLowPower);
            }
        }

        // Safe is left only by an explicit recover command
        if status.external_power && self.mode == SatelliteMode::LowPower {
            info!("External power restored");
            return self.fire(Trigger::Recover);
        }

        None
    }

    pub fn handle_command(
        &mut self,
        command: CommandKind,
        request_id: Option<&str>,
    ) -> Option<SatelliteMode> {
        let Some(trigger) = Trigger::from_command(command) else {
            debug!(?command, "Command not addressed to OBC");
            return None;
        };

        info!(?command, request_id = request_id.unwrap_or("-"), "Ground command");
        self.fire(trigger)
    }

    /// Fires a trigger if the current mode allows it. Guard violations are logged no-ops.
    pub fn fire(&mut self, trigger: Trigger) -> Option<SatelliteMode> {
        let transition = trigger.transition();
        if !transition.allows(self.mode) {
            warn!(?trigger, mode = %self.mode, "Transition not allowed from current mode");
            return None;
        }

        let from = self.mode;
        self.mode = transition.destination;

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(TransitionRecord {
            trigger,
            from,
            to: self.mode,
            timestamp: Utc::now(),
        });

        match self.mode {
            SatelliteMode::Safe => error!(%from, "🚨 Entered Safe mode"),
            SatelliteMode::LowPower => warn!(%from, "🔋 Entered LowPower mode"),
            to => info!(%from, %to, "Mode transition"),
        }

        self.publish_mode();
        Some(self.mode)
    }

    pub fn publish_mode(&mut self) {
        self.outbox.push(ModeStatus {
            state: self.mode,
            timestamp: Utc::now(),
        });
    }

    pub fn take_outbox(&mut self) -> std::vec::Vec<ModeStatus> {
        core::mem::take(&mut self.outbox)
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }
}
