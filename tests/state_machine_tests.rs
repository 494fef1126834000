use chrono::Utc;
use cubesat_flight::protocol::{CommandKind, EpsStatus, Health};
use cubesat_flight::state_machine::{
    ObcStateMachine, SatelliteMode, Trigger, LOW_POWER_BATTERY_PERCENT, SAFE_BATTERY_PERCENT,
    TRANSITIONS,
};
use std::time::{Duration, Instant};

const DEPLOY: Duration = Duration::from_secs(10);

fn eps(battery_percent: Option<f64>, external_power: bool) -> EpsStatus {
    EpsStatus {
        timestamp: Utc::now(),
        battery_percent,
        voltage_volts: Some(3.9),
        external_power,
        health: Health::Ok,
    }
}

/// Walks a fresh machine to the requested mode through legal transitions.
fn machine_in(mode: SatelliteMode) -> ObcStateMachine {
    let mut obc = ObcStateMachine::new(DEPLOY);
    let now = Instant::now();
    match mode {
        SatelliteMode::Boot => {}
        SatelliteMode::Deploy => obc.start(true, now),
        _ => {
            obc.start(true, now);
            obc.tick(now + DEPLOY);
        }
    }
    match mode {
        SatelliteMode::Science => {
            obc.fire(Trigger::StartScience);
        }
        SatelliteMode::LowPower => {
            obc.fire(Trigger::EnterLowPower);
        }
        SatelliteMode::Safe => {
            obc.fire(Trigger::EnterSafeMode);
        }
        _ => {}
    }
    assert_eq!(obc.current_mode(), mode);
    obc.take_outbox();
    obc
}

fn command_trigger(command: CommandKind) -> Trigger {
    match command {
        CommandKind::ScienceStart => Trigger::StartScience,
        CommandKind::ScienceStop => Trigger::EndScience,
        CommandKind::SafeMode => Trigger::EnterSafeMode,
        CommandKind::Recover => Trigger::Recover,
        other => panic!("{other:?} is not a mode command"),
    }
}

#[test]
fn test_boot_sequence() {
    let mut obc = ObcStateMachine::new(DEPLOY);
    assert_eq!(obc.current_mode(), SatelliteMode::Boot);

    let start = Instant::now();
    obc.start(true, start);
    assert_eq!(obc.current_mode(), SatelliteMode::Deploy);

    // Deploy window not yet over
    assert_eq!(obc.tick(start + Duration::from_secs(5)), None);
    assert_eq!(obc.current_mode(), SatelliteMode::Deploy);

    assert_eq!(obc.tick(start + DEPLOY), Some(SatelliteMode::Nominal));

    let published: Vec<SatelliteMode> = obc.take_outbox().iter().map(|s| s.state).collect();
    assert_eq!(
        published,
        vec![SatelliteMode::Boot, SatelliteMode::Deploy, SatelliteMode::Nominal]
    );
    assert!(obc.take_outbox().is_empty());
}

#[test]
fn test_failed_self_test_enters_safe() {
    let mut obc = ObcStateMachine::new(DEPLOY);
    obc.start(false, Instant::now());
    assert_eq!(obc.current_mode(), SatelliteMode::Safe);
}

#[test]
fn test_command_guard_matches_transition_table() {
    let commands = [
        CommandKind::ScienceStart,
        CommandKind::ScienceStop,
        CommandKind::SafeMode,
        CommandKind::Recover,
    ];

    for mode in SatelliteMode::ALL {
        for command in commands {
            let transition = command_trigger(command).transition();
            let mut obc = machine_in(mode);

            let result = obc.handle_command(command, Some("req-1"));

            if transition.allows(mode) {
                assert_eq!(result, Some(transition.destination), "{mode} + {command:?}");
                assert_eq!(obc.current_mode(), transition.destination);
                assert_eq!(obc.take_outbox().len(), 1, "entry must publish once");
            } else {
                assert_eq!(result, None, "{mode} + {command:?} must be rejected");
                assert_eq!(obc.current_mode(), mode);
                assert!(obc.take_outbox().is_empty());
            }
        }
    }
}

#[test]
fn test_transition_table_contents() {
    assert_eq!(TRANSITIONS.len(), 7);
    let safe = Trigger::EnterSafeMode.transition();
    for mode in SatelliteMode::ALL {
        assert!(safe.allows(mode));
    }

    let low_power = Trigger::EnterLowPower.transition();
    assert!(low_power.allows(SatelliteMode::Deploy));
    assert!(!low_power.allows(SatelliteMode::Boot));
    assert!(!low_power.allows(SatelliteMode::Safe));
    assert_eq!(Trigger::Recover.transition().destination, SatelliteMode::Nominal);
}

#[test]
fn test_critical_battery_beats_low_power() {
    let mut obc = machine_in(SatelliteMode::Nominal);

    obc.handle_eps_report(&eps(Some(10.0), false));

    assert_eq!(obc.current_mode(), SatelliteMode::Safe);
    let history = obc.history();
    assert_eq!(history.last().map(|r| r.trigger), Some(Trigger::EnterSafeMode));
}

#[test]
fn test_low_battery_enters_low_power_once() {
    let mut obc = machine_in(SatelliteMode::Science);

    assert_eq!(obc.handle_eps_report(&eps(Some(35.0), false)), Some(SatelliteMode::LowPower));
    obc.take_outbox();

    // Already protective, nothing more to do
    assert_eq!(obc.handle_eps_report(&eps(Some(30.0), false)), None);
    assert!(obc.take_outbox().is_empty());
}

#[test]
fn test_thresholds_are_strict() {
    let mut obc = machine_in(SatelliteMode::Nominal);
    obc.handle_eps_report(&eps(Some(f64::from(LOW_POWER_BATTERY_PERCENT)), false));
    assert_eq!(obc.current_mode(), SatelliteMode::Nominal);

    let mut obc = machine_in(SatelliteMode::LowPower);
    obc.handle_eps_report(&eps(Some(f64::from(SAFE_BATTERY_PERCENT)), false));
    assert_eq!(obc.current_mode(), SatelliteMode::LowPower);
}

#[test]
fn test_missing_battery_reading_changes_nothing() {
    let mut obc = machine_in(SatelliteMode::Nominal);
    assert_eq!(obc.handle_eps_report(&eps(None, false)), None);
    assert_eq!(obc.current_mode(), SatelliteMode::Nominal);
}

#[test]
fn test_external_power_recovers_low_power() {
    let mut obc = machine_in(SatelliteMode::LowPower);
    assert_eq!(obc.handle_eps_report(&eps(Some(45.0), true)), Some(SatelliteMode::Nominal));
}

#[test]
fn test_safe_requires_recover_command() {
    let mut obc = machine_in(SatelliteMode::Safe);

    // External power alone does not leave Safe
    assert_eq!(obc.handle_eps_report(&eps(Some(90.0), true)), None);
    assert_eq!(obc.current_mode(), SatelliteMode::Safe);

    assert_eq!(
        obc.handle_command(CommandKind::Recover, Some("ground-1")),
        Some(SatelliteMode::Nominal)
    );
}

#[test]
fn test_critical_battery_while_safe_is_quiet() {
    let mut obc = machine_in(SatelliteMode::Safe);
    assert_eq!(obc.handle_eps_report(&eps(Some(5.0), false)), None);
    assert!(obc.take_outbox().is_empty());
}

#[test]
fn test_payload_commands_ignored_by_obc() {
    let mut obc = machine_in(SatelliteMode::Nominal);
    assert_eq!(obc.handle_command(CommandKind::TimelapseStart, None), None);
    assert_eq!(obc.current_mode(), SatelliteMode::Nominal);
}

#[test]
fn test_restore_adopts_mode() {
    let mut obc = ObcStateMachine::new(DEPLOY);
    let now = Instant::now();
    assert!(obc.restore(SatelliteMode::Deploy, now));
    assert_eq!(obc.current_mode(), SatelliteMode::Deploy);

    // Deploy timer restarts from the restore point
    obc.tick(now + DEPLOY);
    assert_eq!(obc.current_mode(), SatelliteMode::Nominal);
}

#[test]
fn test_restore_refuses_boot() {
    let mut obc = ObcStateMachine::new(DEPLOY);
    let now = Instant::now();
    assert!(!obc.restore(SatelliteMode::Boot, now));
    assert!(obc.take_outbox().is_empty());

    obc.start(true, now);
    obc.tick(now + DEPLOY);
    assert_eq!(obc.current_mode(), SatelliteMode::Nominal);
}

#[test]
fn test_history_is_bounded() {
    let mut obc = machine_in(SatelliteMode::Nominal);
    for _ in 0..40 {
        obc.fire(Trigger::StartScience);
        obc.fire(Trigger::EndScience);
    }
    assert_eq!(obc.history().len(), 32);
    let last = obc.history().last().expect("history");
    assert_eq!(last.to, SatelliteMode::Nominal);
}

#[test]
fn test_mode_names() {
    assert_eq!(SatelliteMode::LowPower.to_string(), "LowPower");
    assert_eq!(
        serde_json::to_string(&SatelliteMode::LowPower).expect("serialize"),
        "\"LowPower\""
    );
}
