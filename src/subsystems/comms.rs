use super::{FlightAgent, SubsystemId};
use crate::protocol::{BusMessage, DownlinkFrame, PhotoResponse, Topic, MAX_FRAME_PAYLOAD};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Splits `data` into CRC-protected frames of at most `MAX_FRAME_PAYLOAD` bytes.
/// Empty input yields no frames.
pub fn packetize(packet_id: &str, data: &[u8]) -> Vec<DownlinkFrame> {
    let chunks: Vec<&[u8]> = data.chunks(MAX_FRAME_PAYLOAD).collect();
    let Ok(total) = u16::try_from(chunks.len()) else {
        warn!(packet_id, len = data.len(), "Payload needs more than u16::MAX frames");
        return Vec::new();
    };

    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| DownlinkFrame::new(packet_id, index as u16, total, chunk))
        .collect()
}

/// Reassembles frames of one packet. Fails on a missing, duplicate or corrupt frame.
pub fn reassemble(frames: &[DownlinkFrame]) -> Option<Vec<u8>> {
    let first = frames.first()?;
    let total = usize::from(first.total);
    if frames.len() != total {
        return None;
    }

    let mut ordered: Vec<&DownlinkFrame> = frames.iter().collect();
    ordered.sort_by_key(|frame| frame.index);

    let mut data = Vec::with_capacity(total * MAX_FRAME_PAYLOAD);
    for (expected, frame) in ordered.iter().enumerate() {
        if usize::from(frame.index) != expected
            || frame.packet_id != first.packet_id
            || !frame.verify()
        {
            return None;
        }
        data.extend(frame.chunk().ok()?);
    }
    Some(data)
}

/// Forwards captured photos to the downlink as frames.
#[derive(Debug, Default)]
pub struct CommsRelay {
    packets_sent: u32,
    frames_sent: u32,
}

impl CommsRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    pub fn frames_sent(&self) -> u32 {
        self.frames_sent
    }

    pub fn relay(&mut self, response: &PhotoResponse) -> Vec<BusMessage> {
        let PhotoResponse::Ok {
            request_id,
            payload,
            ..
        } = response
        else {
            debug!(request_id = response.request_id(), "Not relaying failed capture");
            return Vec::new();
        };

        let bytes = match STANDARD.decode(payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%request_id, "Photo payload is not valid base64: {}", e);
                return Vec::new();
            }
        };

        let frames = packetize(request_id, &bytes);
        if frames.is_empty() {
            return Vec::new();
        }

        self.packets_sent += 1;
        self.frames_sent += frames.len() as u32;
        info!(%request_id, frames = frames.len(), "Downlinking photo");
        frames.into_iter().map(BusMessage::Downlink).collect()
    }
}

impl FlightAgent for CommsRelay {
    fn id(&self) -> SubsystemId {
        SubsystemId::Comms
    }

    fn subscriptions(&self) -> &'static [Topic] {
        &[Topic::PayloadPhoto]
    }

    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn on_message(&mut self, message: BusMessage) -> Vec<BusMessage> {
        match message {
            BusMessage::Photo(response) => self.relay(&response),
            _ => Vec::new(),
        }
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<BusMessage> {
        Vec::new()
    }
}
