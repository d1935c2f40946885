//! TwinLink Shared Protocol Types
//!
//! This crate provides the wire message types, the length-prefixed frame
//! codec, and the typed payload schemas shared by the device agent and
//! the hub.

pub mod codec;
pub mod schema;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use wire::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol timing parameters shared by both endpoints
pub mod limits {
    /// Telemetry sampling interval in milliseconds
    pub const TELEMETRY_INTERVAL_MS: u64 = 5000;

    /// A session with no traffic for this long is considered dead
    pub const SESSION_TIMEOUT_MS: u64 = 15000;

    /// Default deadline for outbound commands
    pub const DEFAULT_COMMAND_DEADLINE_MS: u64 = 5000;

    /// Initial delay before reconnecting a dropped link
    pub const RECONNECT_DELAY_MS: u64 = 1000;

    /// Upper bound for the exponential reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30000;
}

/// Builder helpers for creating messages
impl Header {
    /// Create a new header with the given device ID and message type
    pub fn new(device_id: impl Into<String>, msg_type: MessageType, sequence_id: u64) -> Self {
        Self {
            device_id: device_id.into(),
            sequence_id,
            timestamp_ms: now_ms(),
            msg_type: msg_type.into(),
        }
    }
}

impl PropertyAck {
    /// Ack for a write that was applied to the device
    pub fn accepted(
        write: &PropertyWrite,
        value_json: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::for_write(write, AckCode::AckAccepted, value_json, message)
    }

    /// Ack for a refused write; `value_json` must carry the device's
    /// current value, never the refused proposal
    pub fn rejected(
        write: &PropertyWrite,
        value_json: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::for_write(write, AckCode::AckRejected, value_json, message)
    }

    /// Ack for a write that matched the device's current value
    pub fn unchanged(
        write: &PropertyWrite,
        value_json: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::for_write(write, AckCode::AckUnchanged, value_json, message)
    }

    // Every ack echoes the component, name, and version of the write
    // it answers
    fn for_write(
        write: &PropertyWrite,
        code: AckCode,
        value_json: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: write.component.clone(),
            name: write.name.clone(),
            value_json: value_json.into(),
            version: write.version,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl CommandResponse {
    /// Response for a command that ran to completion
    pub fn completed(command_id: u64, schema_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command_id,
            status: CommandStatus::StatusCompleted.into(),
            schema_id: schema_id.into(),
            payload,
            message: String::new(),
        }
    }

    /// Response for a handler that failed
    pub fn failed(command_id: u64, message: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::StatusFailed.into(),
            schema_id: String::new(),
            payload: Vec::new(),
            message: message.into(),
        }
    }

    /// Response for a command refused before its handler ran
    pub fn rejected(command_id: u64, message: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::StatusRejected.into(),
            schema_id: String::new(),
            payload: Vec::new(),
            message: message.into(),
        }
    }

    /// Response when no handler is registered for the command
    pub fn unknown_command(command_id: u64, message: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::StatusUnknownCommand.into(),
            schema_id: String::new(),
            payload: Vec::new(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_creation() {
        let header = Header::new("therm-001", MessageType::MsgTelemetry, 1);
        assert_eq!(header.device_id, "therm-001");
        assert_eq!(header.sequence_id, 1);
        assert!(header.timestamp_ms > 0);
    }

    #[test]
    fn test_ack_echoes_write_identity() {
        let write = PropertyWrite {
            component: "thermostat".to_string(),
            name: "targetTemperature".to_string(),
            value_json: "25.0".to_string(),
            version: 7,
        };

        let ack = PropertyAck::accepted(&write, "25.0", "setpoint updated");
        assert_eq!(ack.component, "thermostat");
        assert_eq!(ack.name, "targetTemperature");
        assert_eq!(ack.version, 7);
        assert_eq!(ack.code, AckCode::AckAccepted as i32);

        let ack = PropertyAck::rejected(&write, "22.0", "out of range");
        assert_eq!(ack.version, 7);
        assert_eq!(ack.value_json, "22.0");
    }

    #[test]
    fn test_command_response_builders() {
        let done = CommandResponse::completed(4, "reboot.response", vec![1, 2]);
        assert_eq!(done.command_id, 4);
        assert_eq!(done.status, CommandStatus::StatusCompleted as i32);
        assert_eq!(done.schema_id, "reboot.response");

        let missing = CommandResponse::unknown_command(5, "no handler for thermostat/launch");
        assert_eq!(missing.status, CommandStatus::StatusUnknownCommand as i32);
        assert!(missing.payload.is_empty());
    }
}
