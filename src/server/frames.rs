use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Write these bytes to the write characteristic.
    Data { data: Vec<u8> },
    /// Tear the session down now; the token must equal the one issued in
    /// `connected`.
    ForceCleanup { token: String },
}

/// Frames the server sends.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session is ACTIVE with the BLE link up. Carries the effective session
    /// id so clients with a server-assigned key can reattach.
    Connected {
        device: Option<String>,
        token: String,
        session: String,
    },
    /// Link lost; the session remains reattachable within grace.
    Disconnected,
    /// Notification from the notify characteristic.
    Data { data: Vec<u8> },
    /// Teardown finished; the socket closes next.
    ForceCleanupComplete { message: String },
    /// Non-fatal or fatal failure; the accompanying close frame tells which.
    Error { error: String },
}

impl ServerFrame {
    /// Serializes to the single-JSON-object wire form.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server frames always serialize")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        r#"{"type":"data","data":[167,179,2,217]}"#,
        ClientFrame::Data { data: vec![167, 179, 2, 217] }
    )]
    #[case(
        r#"{"type":"force_cleanup","token":"T"}"#,
        ClientFrame::ForceCleanup { token: "T".to_string() }
    )]
    fn client_frames_deserialize(#[case] json: &str, #[case] expected: ClientFrame) {
        let frame: ClientFrame = serde_json::from_str(json).expect("frame should parse");
        assert_eq!(expected, frame);
    }

    #[rstest]
    #[case(r#"{"type":"reboot"}"#)]
    #[case(r#"{"type":"data"}"#)]
    #[case(r#"{"type":"force_cleanup"}"#)]
    #[case(r#"not json"#)]
    fn malformed_client_frames_are_rejected(#[case] json: &str) {
        assert!(serde_json::from_str::<ClientFrame>(json).is_err());
    }

    #[test]
    fn connected_frame_serializes_with_device_and_token() {
        let frame = ServerFrame::Connected {
            device: Some("CS108Reader42".to_string()),
            token: "T".to_string(),
            session: "s1".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&frame.to_json()).expect("frame should round-trip");
        assert_eq!("connected", json["type"]);
        assert_eq!("CS108Reader42", json["device"]);
        assert_eq!("T", json["token"]);
        assert_eq!("s1", json["session"]);
    }

    #[test]
    fn data_frame_round_trips_byte_arrays() {
        let frame = ServerFrame::Data {
            data: vec![167, 179, 4, 0, 160],
        };
        let parsed: ServerFrame =
            serde_json::from_str(&frame.to_json()).expect("frame should round-trip");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn error_frame_uses_the_error_field() {
        let frame = ServerFrame::Error {
            error: "Another connection is active".to_string(),
        };
        assert_eq!(
            r#"{"type":"error","error":"Another connection is active"}"#,
            frame.to_json()
        );
    }
}
