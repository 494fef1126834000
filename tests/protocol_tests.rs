use chrono::{TimeZone, Utc};
use cubesat_flight::protocol::{
    crc16, BusMessage, CommandKind, DownlinkFrame, EpsStatus, Health, Outbound, PhotoResponse,
    ProtocolError, Topic, MAX_MESSAGE_SIZE,
};
use cubesat_flight::state_machine::SatelliteMode;

#[test]
fn test_topic_paths() {
    assert_eq!(Topic::ModeStatus.path("cubesat"), "cubesat/mode/status");
    assert_eq!(Topic::Command.path("cubesat/"), "cubesat/command");
    assert_eq!(Topic::CommandPhoto.path(""), "command/photo");

    assert_eq!(Topic::from_path("cubesat", "cubesat/payload/photo"), Some(Topic::PayloadPhoto));
    assert_eq!(Topic::from_path("cubesat", "cubesat/unknown"), None);
    assert_eq!(Topic::from_path("cubesat", "other/mode/status"), None);
    // Prefix must end on a path boundary
    assert_eq!(Topic::from_path("cube", "cubesat/mode/status"), None);
}

#[test]
fn test_retained_topics() {
    let retained: Vec<Topic> = Topic::ALL.iter().copied().filter(|t| t.retained()).collect();
    assert_eq!(
        retained,
        vec![Topic::ModeStatus, Topic::EpsStatus, Topic::PayloadStatus, Topic::Telemetry]
    );
    assert!(!Topic::Command.retained());
    assert!(!Topic::CommandPhoto.retained());
}

#[test]
fn test_decode_command() {
    let message = BusMessage::decode(Topic::Command, br#"{"command":"safe_mode","request_id":"g-7"}"#)
        .expect("valid command");

    match message {
        BusMessage::Command(command) => {
            assert_eq!(command.command, CommandKind::SafeMode);
            assert_eq!(command.request_id.as_deref(), Some("g-7"));
            assert_eq!(command.interval_secs, None);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_malformed_payloads_rejected() {
    let cases: [(Topic, &[u8]); 5] = [
        (Topic::Command, b"not json"),
        (Topic::Command, br#"{"command":"self_destruct"}"#),
        (Topic::Command, br#"{"request_id":"x"}"#),
        (Topic::EpsStatus, br#"{"battery_percent":50}"#),
        (Topic::ModeStatus, br#"{"state":"Hibernate","timestamp":"2024-01-01T00:00:00Z"}"#),
    ];

    for (topic, payload) in cases {
        assert!(
            matches!(BusMessage::decode(topic, payload), Err(ProtocolError::InvalidJson(_))),
            "{topic} accepted {:?}",
            String::from_utf8_lossy(payload)
        );
    }
}

#[test]
fn test_semantic_validation() {
    let long_id = "x".repeat(65);
    let payload = format!(r#"{{"request_id":"{long_id}"}}"#);
    assert!(matches!(
        BusMessage::decode(Topic::CommandPhoto, payload.as_bytes()),
        Err(ProtocolError::InvalidField(_))
    ));

    let eps = br#"{"timestamp":"2024-01-01T00:00:00Z","battery_percent":140.0,"voltage_volts":4.1,"external_power":false,"health":"ok"}"#;
    assert!(matches!(
        BusMessage::decode(Topic::EpsStatus, eps),
        Err(ProtocolError::InvalidField(_))
    ));

    let timelapse = br#"{"command":"timelapse_start","interval_secs":0}"#;
    assert!(BusMessage::decode(Topic::Command, timelapse).is_err());
}

#[test]
fn test_oversized_message_rejected() {
    let payload = vec![b' '; MAX_MESSAGE_SIZE + 1];
    assert!(matches!(
        BusMessage::decode(Topic::Telemetry, &payload),
        Err(ProtocolError::MessageTooLarge(_))
    ));
}

#[test]
fn test_absent_battery_is_not_zero() {
    let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let status = EpsStatus {
        timestamp,
        battery_percent: None,
        voltage_volts: None,
        external_power: false,
        health: Health::Error,
    };

    let outbound = Outbound::from_message(&BusMessage::Eps(status.clone())).expect("encode");
    let json: serde_json::Value = serde_json::from_slice(&outbound.payload).expect("json");
    assert!(json["battery_percent"].is_null());
    assert_eq!(json["health"], "error");
    assert!(outbound.retain);

    assert_eq!(outbound.decode().expect("decode"), BusMessage::Eps(status));
}

#[test]
fn test_mode_status_wire_format() {
    let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let message = BusMessage::Mode(cubesat_flight::protocol::ModeStatus {
        state: SatelliteMode::LowPower,
        timestamp,
    });
    let json: serde_json::Value =
        serde_json::from_slice(&message.encode().expect("encode")).expect("json");
    assert_eq!(json["state"], "LowPower");
    assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
}

#[test]
fn test_photo_response_shapes() {
    let error = PhotoResponse::Error {
        request_id: "r1".into(),
        reason: "Photo capture not allowed: OBC state is 'Safe'".into(),
    };
    let json = serde_json::to_value(&error).expect("json");
    assert_eq!(json["status"], "error");
    assert!(json.get("path").is_none());

    let ok = PhotoResponse::Ok {
        request_id: "r2".into(),
        path: "/data/photos/r2.jpg".into(),
        size_bytes: 3,
        taken_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        payload: "AAEC".into(),
    };
    let json = serde_json::to_value(&ok).expect("json");
    assert_eq!(json["status"], "ok");
    assert!(json.get("reason").is_none());
    assert_eq!(ok.request_id(), "r2");
}

#[test]
fn test_crc16_known_vector() {
    // CRC-16/CCITT-FALSE check value
    assert_eq!(crc16(b"123456789"), 0x29B1);
    assert_eq!(crc16(b""), 0xFFFF);
}

#[test]
fn test_crc16_deterministic_and_detects_bit_flips() {
    let data: Vec<u8> = (0..=255u8).cycle().take(600).collect();
    let reference = crc16(&data);
    assert_eq!(crc16(&data), reference);

    for byte in [0, 1, 199, 300, 599] {
        for bit in 0..8 {
            let mut corrupted = data.clone();
            corrupted[byte] ^= 1 << bit;
            assert_ne!(crc16(&corrupted), reference, "flip at {byte}:{bit}");
        }
    }
}

#[test]
fn test_downlink_frame_verify() {
    let frame = DownlinkFrame::new("req_1", 0, 1, b"hello");
    assert!(frame.verify());

    let mut tampered = frame.clone();
    tampered.crc16 ^= 0x0100;
    assert!(!tampered.verify());

    let invalid_index = DownlinkFrame::new("req_1", 2, 2, b"x");
    assert!(BusMessage::Downlink(invalid_index).validate().is_err());
}
