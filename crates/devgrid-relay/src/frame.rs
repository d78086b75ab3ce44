//! The terminal wire protocol.
//!
//! Each frame is a JSON object discriminated by `type`. `input`/`output`
//! carry a `data` string, `resize` carries integer geometry, `ping`/`pong`
//! carry nothing, and `error` carries a message after which the relay
//! closes the connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Raw bytes for the exec stream.
    Input { data: String },
    /// Terminal geometry change, forwarded as a control message.
    Resize { cols: u16, rows: u16 },
    /// Heartbeat; answered with `Pong`, never forwarded.
    Ping,
    Pong,
    /// Bytes from the exec stream back to the client.
    Output { data: String },
    /// Fatal; the session closes after delivery.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_wire_shape() {
        let frame = Frame::Input {
            data: "ls -la\n".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "input", "data": "ls -la\n"})
        );
    }

    #[test]
    fn resize_wire_shape() {
        let frame = Frame::Resize { cols: 120, rows: 40 };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "resize", "cols": 120, "rows": 40})
        );
    }

    #[test]
    fn heartbeat_frames_carry_no_payload() {
        assert_eq!(
            serde_json::to_value(Frame::Ping).unwrap(),
            json!({"type": "ping"})
        );
        assert_eq!(
            serde_json::to_value(Frame::Pong).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn error_wire_shape() {
        let frame = Frame::Error {
            message: "session idle timeout".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "error", "message": "session idle timeout"})
        );
    }

    #[test]
    fn frames_round_trip() {
        let frames = vec![
            Frame::Input { data: "x".into() },
            Frame::Resize { cols: 80, rows: 24 },
            Frame::Ping,
            Frame::Pong,
            Frame::Output { data: "y".into() },
            Frame::Error { message: "z".into() },
        ];
        for frame in frames {
            let wire = serde_json::to_string(&frame).unwrap();
            let back: Frame = serde_json::from_str(&wire).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result: Result<Frame, _> = serde_json::from_str(r#"{"type": "exec"}"#);
        assert!(result.is_err());
    }
}
