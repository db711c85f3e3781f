//! Control protocol messages
//!
//! The request/response vocabulary between the controller and its worker.
//! The serde form is the wire shape: one JSON object per message with a
//! `type` discriminator, so the same types round-trip through any framed
//! transport even though the in-process channel moves them as values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One control message. Requests flow controller → worker, responses flow
/// back, with exactly one request in flight at a time. `AuthRequired` /
/// `AuthResponse` are the one nested exchange: they ride inside an
/// outstanding `Connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Establish the SSH session from the worker's configuration.
    Connect,
    /// Open the local port forward, replacing any existing one.
    Forward {
        local_host: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    /// Run a command on the remote host and wait for it.
    RunCommand { command: String },
    /// Resolve the remote home directory.
    GetHome,
    /// Tear the session down and end the worker.
    Shutdown,
    /// Success reply. `payload` carries operation output where there is any.
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Failure reply.
    Error { message: String },
    /// The worker needs a secret to continue connecting.
    AuthRequired,
    /// The controller's answer to `AuthRequired`. An empty secret means the
    /// operator declined.
    AuthResponse { secret: String },
    /// Worker liveness handshake, sent once right after spawn.
    Started { pid: u32 },
    /// The worker's final message before it ends.
    Exited { code: i32 },
}

impl ControlMessage {
    /// The wire discriminator, exactly as it appears in the serialized form.
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Connect => "connect",
            ControlMessage::Forward { .. } => "forward",
            ControlMessage::RunCommand { .. } => "run_command",
            ControlMessage::GetHome => "get_home",
            ControlMessage::Shutdown => "shutdown",
            ControlMessage::Ok { .. } => "ok",
            ControlMessage::Error { .. } => "error",
            ControlMessage::AuthRequired => "auth_required",
            ControlMessage::AuthResponse { .. } => "auth_response",
            ControlMessage::Started { .. } => "started",
            ControlMessage::Exited { .. } => "exited",
        }
    }

    /// Plain success reply.
    pub fn ok() -> Self {
        ControlMessage::Ok { payload: None }
    }

    /// Success reply carrying `payload`.
    pub fn ok_with<T: Serialize>(payload: &T) -> Self {
        ControlMessage::Ok {
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error {
            message: message.into(),
        }
    }
}

/// Output of one remote command execution. A non-zero `exit_status` is a
/// normal result, not a protocol error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the backend did not report a status (e.g. the channel
    /// closed without one).
    pub exit_status: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_has_type_discriminator() {
        let json = serde_json::to_string(&ControlMessage::Connect).unwrap();
        assert_eq!(json, r#"{"type":"connect"}"#);

        let json = serde_json::to_string(&ControlMessage::Started { pid: 4242 }).unwrap();
        assert_eq!(json, r#"{"type":"started","pid":4242}"#);
    }

    #[test]
    fn test_plain_ok_omits_payload() {
        let json = serde_json::to_string(&ControlMessage::ok()).unwrap();
        assert_eq!(json, r#"{"type":"ok"}"#);
    }

    #[test]
    fn test_ok_with_command_output_round_trips() {
        let output = CommandOutput {
            stdout: "/home/alice\n".to_string(),
            stderr: String::new(),
            exit_status: Some(0),
        };
        let msg = ControlMessage::ok_with(&output);
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        match back {
            ControlMessage::Ok { payload: Some(value) } => {
                let parsed: CommandOutput = serde_json::from_value(value).unwrap();
                assert_eq!(parsed, output);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_tag_matches_serialized_discriminator() {
        let samples = [
            ControlMessage::Connect,
            ControlMessage::Forward {
                local_host: "127.0.0.1".into(),
                local_port: 9000,
                remote_host: "127.0.0.1".into(),
                remote_port: 9000,
            },
            ControlMessage::RunCommand { command: "true".into() },
            ControlMessage::GetHome,
            ControlMessage::Shutdown,
            ControlMessage::ok(),
            ControlMessage::error("boom"),
            ControlMessage::AuthRequired,
            ControlMessage::AuthResponse { secret: "s".into() },
            ControlMessage::Started { pid: 1 },
            ControlMessage::Exited { code: 0 },
        ];
        for msg in samples {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], msg.tag(), "mismatch for {:?}", msg);
        }
    }

    #[test]
    fn test_auth_exchange_round_trips() {
        let json = r#"{"type":"auth_response","secret":"hunter2"}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ControlMessage::AuthResponse { secret: "hunter2".to_string() }
        );
    }
}
