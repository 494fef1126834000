use chrono::Utc;
use cubesat_flight::bus::BusHandle;
use cubesat_flight::protocol::{
    BusMessage, CommandKind, GroundCommand, ModeStatus, PayloadState, PhotoCommand, PhotoResponse,
    Topic,
};
use cubesat_flight::sensors::{
    Camera, EnvironmentReading, EnvironmentSensor, SensorError, SimulatedCamera,
    SimulatedEnvironment,
};
use cubesat_flight::state_machine::SatelliteMode;
use cubesat_flight::subsystems::{FlightAgent, PayloadAgent};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Counts captures and writes a tiny file to a private temp dir.
struct CountingCamera {
    calls: Arc<AtomicUsize>,
    dir: PathBuf,
}

impl Camera for CountingCamera {
    fn capture(&mut self, request_id: &str, _overlay: bool) -> Result<PathBuf, SensorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{request_id}.jpg"));
        std::fs::write(&path, [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9])?;
        Ok(path)
    }
}

struct BrokenCamera;

impl Camera for BrokenCamera {
    fn capture(&mut self, _request_id: &str, _overlay: bool) -> Result<PathBuf, SensorError> {
        Err(SensorError::Read {
            device: "camera",
            reason: "no frame".into(),
        })
    }
}

struct NoEnvironment;

impl EnvironmentSensor for NoEnvironment {
    fn read(&mut self) -> EnvironmentReading {
        EnvironmentReading::default()
    }
}

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cubesat-{name}-{}", uuid::Uuid::new_v4()))
}

fn agent_with_counter() -> (PayloadAgent, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let camera = CountingCamera {
        calls: Arc::clone(&calls),
        dir: temp_dir("photos"),
    };
    let agent = PayloadAgent::new(
        Box::new(camera),
        Box::new(SimulatedEnvironment::new()),
        Duration::from_secs(60),
    );
    (agent, calls)
}

fn set_mode(agent: &mut PayloadAgent, state: SatelliteMode) {
    let replies = agent.on_message(BusMessage::Mode(ModeStatus {
        state,
        timestamp: Utc::now(),
    }));
    assert!(replies.is_empty());
}

fn photo_request(id: &str) -> BusMessage {
    BusMessage::PhotoRequest(PhotoCommand {
        request_id: Some(id.to_string()),
        overlay: false,
    })
}

fn photo_response(messages: &[BusMessage]) -> &PhotoResponse {
    messages
        .iter()
        .find_map(|m| match m {
            BusMessage::Photo(response) => Some(response),
            _ => None,
        })
        .expect("photo response")
}

#[test]
fn test_photo_rejected_in_low_power_without_camera_call() {
    let (mut agent, calls) = agent_with_counter();
    set_mode(&mut agent, SatelliteMode::LowPower);

    let replies = agent.on_message(photo_request("req-low"));

    match photo_response(&replies) {
        PhotoResponse::Error { request_id, reason } => {
            assert_eq!(request_id, "req-low");
            assert!(reason.contains("LowPower"), "reason: {reason}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_photo_rejected_before_mode_known() {
    let (mut agent, calls) = agent_with_counter();

    let replies = agent.on_message(photo_request("req-early"));

    assert!(!photo_response(&replies).is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_photo_in_nominal() {
    let (mut agent, calls) = agent_with_counter();
    set_mode(&mut agent, SatelliteMode::Nominal);

    let replies = agent.on_message(photo_request("req-ok"));

    match photo_response(&replies) {
        PhotoResponse::Ok {
            request_id,
            size_bytes,
            payload,
            path,
            ..
        } => {
            assert_eq!(request_id, "req-ok");
            assert_eq!(*size_bytes, 6);
            assert_eq!(payload, "/9gBAv/Z");
            assert!(path.ends_with("req-ok.jpg"));
        }
        other => panic!("expected photo, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.photos_taken(), 1);

    // Status follows the response and carries the correlation id
    let status = replies.iter().find_map(|m| match m {
        BusMessage::PayloadStatus(s) => Some(s),
        _ => None,
    });
    assert_eq!(
        status.and_then(|s| s.last_request_id.as_deref()),
        Some("req-ok")
    );
}

#[test]
fn test_redelivered_request_repeats_response() {
    let (mut agent, calls) = agent_with_counter();
    set_mode(&mut agent, SatelliteMode::Nominal);

    let first = agent.on_message(photo_request("dup"));
    let again = agent.on_message(photo_request("dup"));

    assert_eq!(again.len(), 1);
    assert_eq!(photo_response(&again), photo_response(&first));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.photos_taken(), 1);
}

#[test]
fn test_retry_after_rejection_is_evaluated_again() {
    let (mut agent, calls) = agent_with_counter();

    let rejected = agent.on_message(photo_request("r1"));
    assert!(!photo_response(&rejected).is_ok());

    set_mode(&mut agent, SatelliteMode::Nominal);
    let retried = agent.on_message(photo_request("r1"));
    assert!(photo_response(&retried).is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_generated_request_id() {
    let (mut agent, _calls) = agent_with_counter();
    set_mode(&mut agent, SatelliteMode::Science);

    let replies = agent.on_message(BusMessage::PhotoRequest(PhotoCommand::default()));
    let response = photo_response(&replies);
    assert!(response.request_id().starts_with("req_"));
    assert!(!response.is_ok());
}

#[test]
fn test_camera_failure_reported() {
    let mut agent = PayloadAgent::new(
        Box::new(BrokenCamera),
        Box::new(NoEnvironment),
        Duration::from_secs(60),
    );
    set_mode(&mut agent, SatelliteMode::Nominal);

    let replies = agent.on_message(photo_request("broken"));
    match photo_response(&replies) {
        PhotoResponse::Error { reason, .. } => assert!(reason.contains("no frame")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(agent.photos_taken(), 0);
}

#[test]
fn test_science_tick_reports_absent_values() {
    let mut agent = PayloadAgent::new(
        Box::new(BrokenCamera),
        Box::new(NoEnvironment),
        Duration::from_secs(60),
    );

    let messages = agent.on_tick(std::time::Instant::now());
    let sample = messages
        .iter()
        .find_map(|m| match m {
            BusMessage::Science(s) => Some(s),
            _ => None,
        })
        .expect("science sample");
    assert_eq!(sample.temperature_c, None);
    assert_eq!(messages.last().map(BusMessage::topic), Some(Topic::PayloadStatus));
}

#[test]
fn test_timelapse_rejected_outside_nominal() {
    let (mut agent, _calls) = agent_with_counter();
    set_mode(&mut agent, SatelliteMode::Safe);

    let mut command = GroundCommand::new(CommandKind::TimelapseStart);
    command.request_id = Some("tl-1".into());
    let replies = agent.on_message(BusMessage::Command(command));

    match photo_response(&replies) {
        PhotoResponse::Error { request_id, reason } => {
            assert_eq!(request_id, "tl-1");
            assert!(reason.contains("Safe"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!agent.timelapse_running());
}

#[tokio::test]
async fn test_timelapse_captures_and_stops() {
    let (tx, mut rx) = mpsc::channel(16);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut agent = PayloadAgent::new(
        Box::new(CountingCamera {
            calls: Arc::clone(&calls),
            dir: temp_dir("timelapse"),
        }),
        Box::new(NoEnvironment),
        Duration::from_secs(60),
    );
    agent.attach(BusHandle::new(tx));
    set_mode(&mut agent, SatelliteMode::Nominal);

    let mut command = GroundCommand::new(CommandKind::TimelapseStart);
    command.interval_secs = Some(1);
    let replies = agent.on_message(BusMessage::Command(command));
    assert!(agent.timelapse_running());
    match replies.first() {
        Some(BusMessage::PayloadStatus(status)) => {
            assert_eq!(status.state, PayloadState::Timelapse);
            assert_eq!(status.timelapse_interval_secs, Some(1));
        }
        other => panic!("unexpected {other:?}"),
    }

    // First frame is immediate
    let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("frame in time")
        .expect("channel open");
    assert_eq!(frame.topic, Topic::PayloadPhoto);
    match frame.decode().expect("decode") {
        BusMessage::Photo(response) => assert!(response.is_ok()),
        other => panic!("unexpected {other:?}"),
    }

    assert!(agent.stop_timelapse_and_wait().await);
    assert!(!agent.timelapse_running());
    assert!(calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_timelapse_frames_rechecks_mode() {
    let (tx, mut rx) = mpsc::channel(16);
    let (mut agent, calls) = agent_with_counter();
    agent.attach(BusHandle::new(tx));
    set_mode(&mut agent, SatelliteMode::Nominal);

    let mut command = GroundCommand::new(CommandKind::TimelapseStart);
    command.interval_secs = Some(1);
    agent.on_message(BusMessage::Command(command));

    let _first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("first frame");
    let captured = calls.load(Ordering::SeqCst);

    set_mode(&mut agent, SatelliteMode::LowPower);
    let next = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("second frame")
        .expect("channel open");
    match next.decode().expect("decode") {
        BusMessage::Photo(PhotoResponse::Error { reason, .. }) => {
            assert!(reason.contains("LowPower"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), captured);

    let stop = agent.on_message(BusMessage::Command(GroundCommand::new(CommandKind::TimelapseStop)));
    assert_eq!(stop.len(), 1);
    assert!(!agent.timelapse_running());
}

#[test]
fn test_simulated_camera_writes_file() {
    let dir = temp_dir("sim");
    let mut camera = SimulatedCamera::new(dir.clone());
    let path = camera.capture("a/b", true).expect("capture");
    assert!(path.starts_with(&dir));
    assert!(std::fs::metadata(&path).expect("file").len() > 0);
}
