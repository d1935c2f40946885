//! Wire message definitions for the TwinLink protocol
//!
//! Every frame on the wire is an [`Envelope`]: a header identifying the
//! sender plus exactly one payload variant. Property values travel as JSON
//! text inside `value_json` fields so the twin layer stays agnostic of the
//! value types; command payloads travel as raw bytes tagged with a schema
//! id (see [`crate::schema`]).

/// Message types carried in the envelope header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    MsgUnknown = 0,
    MsgTelemetry = 1,
    MsgPropertyWrite = 2,
    MsgPropertyAck = 3,
    MsgReportedUpdate = 4,
    MsgTwinSnapshot = 5,
    MsgCommandRequest = 6,
    MsgCommandResponse = 7,
}

/// Acknowledgement code for a desired property write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AckCode {
    AckUnknown = 0,
    /// The proposed value was applied to the device
    AckAccepted = 1,
    /// The proposal was refused; the ack carries the device's current value
    AckRejected = 2,
    /// The device was already at the proposed value
    AckUnchanged = 3,
}

/// Terminal status of a command exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommandStatus {
    StatusUnknown = 0,
    StatusCompleted = 1,
    StatusFailed = 2,
    StatusRejected = 3,
    StatusUnknownCommand = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(uint64, tag = "2")]
    pub sequence_id: u64,
    #[prost(uint64, tag = "3")]
    pub timestamp_ms: u64,
    #[prost(enumeration = "MessageType", tag = "4")]
    pub msg_type: i32,
}

/// One periodic sensor sample from a device component
#[derive(Clone, PartialEq, prost::Message)]
pub struct Telemetry {
    #[prost(string, tag = "1")]
    pub component: String,
    #[prost(string, tag = "2")]
    pub metric: String,
    #[prost(double, tag = "3")]
    pub value: f64,
    #[prost(uint64, tag = "4")]
    pub sampled_at_ms: u64,
}

/// A desired property write pushed from the hub to a device
#[derive(Clone, PartialEq, prost::Message)]
pub struct PropertyWrite {
    #[prost(string, tag = "1")]
    pub component: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub value_json: String,
    #[prost(uint64, tag = "4")]
    pub version: u64,
}

/// Device acknowledgement of one property write.
///
/// `version` always echoes the version of the write being answered, never
/// a newer one, so the hub can match acks to the writes it issued.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PropertyAck {
    #[prost(string, tag = "1")]
    pub component: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub value_json: String,
    #[prost(uint64, tag = "4")]
    pub version: u64,
    #[prost(enumeration = "AckCode", tag = "5")]
    pub code: i32,
    #[prost(string, tag = "6")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReportedEntry {
    #[prost(string, tag = "1")]
    pub component: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub value_json: String,
}

/// Device-to-hub update of one or more reported property values
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReportedUpdate {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<ReportedEntry>,
}

/// Hub-to-device view of the reported twin state, sent on registration
#[derive(Clone, PartialEq, prost::Message)]
pub struct TwinSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<ReportedEntry>,
}

/// A command invocation; the payload encoding is named by `schema_id`
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandRequest {
    #[prost(uint64, tag = "1")]
    pub command_id: u64,
    #[prost(string, tag = "2")]
    pub component: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub schema_id: String,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

/// Reply to a [`CommandRequest`], correlated by `command_id`
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandResponse {
    #[prost(uint64, tag = "1")]
    pub command_id: u64,
    #[prost(enumeration = "CommandStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub schema_id: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "5")]
    pub message: String,
}

/// Top-level frame exchanged between agent and hub
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(oneof = "envelope::Payload", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub payload: Option<envelope::Payload>,
}

pub mod envelope {
    /// Payload variants carried by [`super::Envelope`]
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Telemetry(super::Telemetry),
        #[prost(message, tag = "11")]
        PropertyWrite(super::PropertyWrite),
        #[prost(message, tag = "12")]
        PropertyAck(super::PropertyAck),
        #[prost(message, tag = "13")]
        ReportedUpdate(super::ReportedUpdate),
        #[prost(message, tag = "14")]
        TwinSnapshot(super::TwinSnapshot),
        #[prost(message, tag = "15")]
        CommandRequest(super::CommandRequest),
        #[prost(message, tag = "16")]
        CommandResponse(super::CommandResponse),
    }
}
