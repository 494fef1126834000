//! Payload agent: camera under the mode guard, science sampling and timelapse.
//!
//! Photo capture is a restricted action. The cached mode is checked right
//! before every capture, including each frame of a running timelapse, and a
//! rejection is always answered with a [`PhotoResponse::Error`] carrying the
//! request id.

use super::{FlightAgent, ModeCache, SubsystemId};
use crate::bus::{BusError, BusHandle};
use crate::protocol::{
    BusMessage, CommandKind, GroundCommand, PayloadState, PayloadStatus, PhotoCommand,
    PhotoResponse, ScienceSample, Topic, MAX_MESSAGE_SIZE, MAX_REQUEST_ID_LEN,
};
use crate::sensors::{Camera, EnvironmentSensor, SensorError};
use crate::state_machine::SatelliteMode;
use arrayvec::ArrayString;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use heapless::Deque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECENT_REQUESTS: usize = 16;
pub const TIMELAPSE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMELAPSE_INTERVAL_SECS: u64 = 60;

type RequestId = ArrayString<MAX_REQUEST_ID_LEN>;

/// Camera plus its counters, shared with the timelapse task.
struct PhotoDesk {
    camera: Mutex<Box<dyn Camera>>,
    photos_taken: AtomicU32,
}

struct Timelapse {
    interval_secs: u64,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PayloadAgent {
    desk: Arc<PhotoDesk>,
    environment: Box<dyn EnvironmentSensor>,
    mode: ModeCache,
    science_interval: Duration,
    /// Completed captures by request id, answered again on redelivery.
    recent_requests: Deque<(RequestId, PhotoResponse), RECENT_REQUESTS>,
    last_request_id: Option<String>,
    timelapse: Option<Timelapse>,
    bus: Option<BusHandle>,
}

impl PayloadAgent {
    pub fn new(
        camera: Box<dyn Camera>,
        environment: Box<dyn EnvironmentSensor>,
        science_interval: Duration,
    ) -> Self {
        Self {
            desk: Arc::new(PhotoDesk {
                camera: Mutex::new(camera),
                photos_taken: AtomicU32::new(0),
            }),
            environment,
            mode: ModeCache::new(),
            science_interval,
            recent_requests: Deque::new(),
            last_request_id: None,
            timelapse: None,
            bus: None,
        }
    }

    pub fn cached_mode(&self) -> &ModeCache {
        &self.mode
    }

    pub fn photos_taken(&self) -> u32 {
        self.desk.photos_taken.load(Ordering::Relaxed)
    }

    pub fn timelapse_running(&self) -> bool {
        self.timelapse.is_some()
    }

    pub fn get_state(&self) -> PayloadStatus {
        PayloadStatus {
            timestamp: Utc::now(),
            state: if self.timelapse.is_some() {
                PayloadState::Timelapse
            } else {
                PayloadState::Idle
            },
            photos_taken: self.photos_taken(),
            last_request_id: self.last_request_id.clone(),
            timelapse_interval_secs: self.timelapse.as_ref().map(|t| t.interval_secs),
        }
    }

    pub fn sample_science(&mut self) -> ScienceSample {
        let reading = self.environment.read();
        ScienceSample {
            timestamp: Utc::now(),
            temperature_c: reading.temperature_c.filter(|v| v.is_finite()),
            humidity_pct: reading.humidity_pct.filter(|v| v.is_finite()),
            pressure_hpa: reading.pressure_hpa.filter(|v| v.is_finite()),
        }
    }

    /// Answers one photo request.
    ///
    /// A redelivered id that already produced a photo gets the same response
    /// again without touching the camera. Rejections are not remembered, so a
    /// retry is evaluated against the current mode.
    pub fn handle_photo_request(&mut self, request: &PhotoCommand) -> Vec<BusMessage> {
        let request_id = request.request_id.clone().unwrap_or_else(generate_request_id);

        if let Some(previous) = self.completed_response(&request_id) {
            debug!(%request_id, "Duplicate photo request, repeating response");
            return vec![BusMessage::Photo(previous)];
        }
        self.last_request_id = Some(request_id.clone());

        let response = capture_photo(&self.desk, &self.mode, &request_id, request.overlay);
        if response.is_ok() {
            self.remember_response(&request_id, &response);
        }
        vec![
            BusMessage::Photo(response),
            BusMessage::PayloadStatus(self.get_state()),
        ]
    }

    pub fn handle_command(&mut self, command: &GroundCommand) -> Vec<BusMessage> {
        match command.command {
            CommandKind::TimelapseStart => {
                let request_id = command.request_id.clone().unwrap_or_else(generate_request_id);
                let interval_secs = command
                    .interval_secs
                    .unwrap_or(DEFAULT_TIMELAPSE_INTERVAL_SECS);
                match self.start_timelapse(interval_secs) {
                    Ok(()) => vec![BusMessage::PayloadStatus(self.get_state())],
                    Err(reason) => vec![BusMessage::Photo(PhotoResponse::Error {
                        request_id,
                        reason,
                    })],
                }
            }
            CommandKind::TimelapseStop => {
                if self.stop_timelapse() {
                    vec![BusMessage::PayloadStatus(self.get_state())]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Starts the background capture loop. The mode guard applies to the start
    /// request and again to every frame.
    pub fn start_timelapse(&mut self, interval_secs: u64) -> Result<(), String> {
        if let Some(reason) = guard_reason(&self.mode, "Timelapse") {
            warn!("{}", reason);
            return Err(reason);
        }
        if self.timelapse.is_some() {
            info!("Timelapse already running");
            return Ok(());
        }
        let Some(bus) = self.bus.clone() else {
            return Err("Timelapse unavailable: bus not attached".to_string());
        };

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_timelapse(
            Arc::clone(&self.desk),
            self.mode.clone(),
            bus,
            Duration::from_secs(interval_secs.max(1)),
            stop_rx,
        ));

        info!(interval_secs, "📸 Timelapse started");
        self.timelapse = Some(Timelapse {
            interval_secs,
            stop,
            task,
        });
        Ok(())
    }

    /// Signals the timelapse task and reaps it in the background with a bounded join.
    pub fn stop_timelapse(&mut self) -> bool {
        let Some(timelapse) = self.timelapse.take() else {
            return false;
        };
        let _ = timelapse.stop.send(true);
        tokio::spawn(join_bounded(timelapse.task));
        info!("Timelapse stopped");
        true
    }

    /// Like [`stop_timelapse`](Self::stop_timelapse) but waits for the task.
    /// Returns false if it had to be aborted.
    pub async fn stop_timelapse_and_wait(&mut self) -> bool {
        let Some(timelapse) = self.timelapse.take() else {
            return true;
        };
        let _ = timelapse.stop.send(true);
        join_bounded(timelapse.task).await
    }

    fn completed_response(&self, request_id: &str) -> Option<PhotoResponse> {
        let id = RequestId::from(request_id).ok()?;
        self.recent_requests
            .iter()
            .find(|(seen, _)| *seen == id)
            .map(|(_, response)| response.clone())
    }

    fn remember_response(&mut self, request_id: &str, response: &PhotoResponse) {
        let Ok(id) = RequestId::from(request_id) else {
            return;
        };
        if self.recent_requests.is_full() {
            self.recent_requests.pop_front();
        }
        let _ = self.recent_requests.push_back((id, response.clone()));
    }
}

impl FlightAgent for PayloadAgent {
    fn id(&self) -> SubsystemId {
        SubsystemId::Payload
    }

    fn subscriptions(&self) -> &'static [Topic] {
        &[Topic::ModeStatus, Topic::Command, Topic::CommandPhoto]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.science_interval)
    }

    fn attach(&mut self, bus: BusHandle) {
        self.bus = Some(bus);
    }

    fn on_start(&mut self, _now: Instant) -> Vec<BusMessage> {
        vec![BusMessage::PayloadStatus(self.get_state())]
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage> {
        match message {
            BusMessage::Mode(status) => {
                self.mode.set(status.state);
                // Leaving Nominal does not kill the timelapse; each frame re-checks
                Vec::new()
            }
            BusMessage::PhotoRequest(request) => self.handle_photo_request(&request),
            BusMessage::Command(command) => self.handle_command(&command),
            _ => Vec::new(),
        }
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<BusMessage> {
        vec![
            BusMessage::Science(self.sample_science()),
            BusMessage::PayloadStatus(self.get_state()),
        ]
    }

    fn on_shutdown(&mut self) {
        self.stop_timelapse();
    }
}

fn generate_request_id() -> String {
    format!("req_{}", Utc::now().timestamp_millis())
}

fn guard_reason(mode: &ModeCache, action: &str) -> Option<String> {
    match mode.get() {
        Some(SatelliteMode::Nominal) => None,
        other => {
            let state = other.map_or("unknown", SatelliteMode::as_str);
            Some(format!("{action} not allowed: OBC state is '{state}'"))
        }
    }
}

fn capture_photo(desk: &PhotoDesk, mode: &ModeCache, request_id: &str, overlay: bool) -> PhotoResponse {
    if let Some(reason) = guard_reason(mode, "Photo capture") {
        warn!(request_id, "{}", reason);
        return PhotoResponse::Error {
            request_id: request_id.to_string(),
            reason,
        };
    }

    let captured = {
        let mut camera = match desk.camera.lock() {
            Ok(camera) => camera,
            Err(poisoned) => poisoned.into_inner(),
        };
        camera.capture(request_id, overlay)
    };

    let result = captured.and_then(|path| {
        let bytes = std::fs::read(&path)?;
        Ok::<_, SensorError>((path, bytes))
    });

    match result {
        Ok((path, bytes)) => {
            let payload = STANDARD.encode(&bytes);
            // Leave room for the JSON envelope
            if payload.len() + 1024 > MAX_MESSAGE_SIZE {
                return PhotoResponse::Error {
                    request_id: request_id.to_string(),
                    reason: format!("Photo too large for bus: {} bytes", bytes.len()),
                };
            }
            desk.photos_taken.fetch_add(1, Ordering::Relaxed);
            info!(request_id, path = %path.display(), size = bytes.len(), "📷 Photo captured");
            PhotoResponse::Ok {
                request_id: request_id.to_string(),
                path: path.display().to_string(),
                size_bytes: bytes.len() as u64,
                taken_at: Utc::now(),
                payload,
            }
        }
        Err(e) => {
            warn!(request_id, "Capture failed: {}", e);
            PhotoResponse::Error {
                request_id: request_id.to_string(),
                reason: format!("Capture failed: {e}"),
            }
        }
    }
}

async fn run_timelapse(
    desk: Arc<PhotoDesk>,
    mode: ModeCache,
    bus: BusHandle,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut frame: u64 = 0;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                frame += 1;
                let request_id = format!("timelapse_{}_{}", Utc::now().format("%Y%m%dT%H%M%S"), frame);
                let response = capture_photo(&desk, &mode, &request_id, false);
                match bus.try_publish_message(&BusMessage::Photo(response)) {
                    Ok(()) => {}
                    Err(BusError::Closed) => {
                        warn!("Bus closed, stopping timelapse");
                        break;
                    }
                    Err(e) => warn!(frame, "Timelapse frame not published: {}", e),
                }
            }
        }
    }
    debug!(frames = frame, "Timelapse task exited");
}

async fn join_bounded(mut task: JoinHandle<()>) -> bool {
    match tokio::time::timeout(TIMELAPSE_JOIN_TIMEOUT, &mut task).await {
        Ok(_) => true,
        Err(_) => {
            warn!("Timelapse task did not stop within {:?}, aborting", TIMELAPSE_JOIN_TIMEOUT);
            task.abort();
            false
        }
    }
}
