//! Typed command payload schemas
//!
//! Command payloads travel as opaque bytes tagged with a schema id. Every
//! payload type implements [`Schema`]: a stable identifier, its wire
//! encoding, and byte-level serialize/deserialize. Callers that know the
//! expected type use the trait directly; generic consumers go through
//! [`SchemaRegistry`], which decodes any registered id into a
//! [`PayloadValue`].

use bytes::Bytes;
use prost::Message;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Wire encoding used by a payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Binary,
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary payload decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("binary payload encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("unknown schema id: {0}")]
    UnknownSchema(String),
}

/// Serialize/deserialize capability carried by every payload type
pub trait Schema: Sized + Send + 'static {
    /// Stable identifier put on the wire next to the payload bytes
    const SCHEMA_ID: &'static str;
    const ENCODING: Encoding;

    fn to_bytes(&self) -> Result<Bytes, SchemaError>;
    fn from_bytes(data: &[u8]) -> Result<Self, SchemaError>;
}

fn json_to_bytes<T: Serialize>(value: &T) -> Result<Bytes, SchemaError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn json_from_bytes<T: DeserializeOwned>(data: &[u8]) -> Result<T, SchemaError> {
    Ok(serde_json::from_slice(data)?)
}

/// Hub-to-device request to reboot at a given time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebootRequest {
    /// Requested reboot time, milliseconds since the Unix epoch.
    /// A time at or before now means reboot immediately.
    pub when_to_reboot_ms: u64,
}

impl Schema for RebootRequest {
    const SCHEMA_ID: &'static str = "reboot.request";
    const ENCODING: Encoding = Encoding::Json;

    fn to_bytes(&self) -> Result<Bytes, SchemaError> {
        json_to_bytes(self)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SchemaError> {
        json_from_bytes(data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebootResponse {
    pub status: String,
}

impl Schema for RebootResponse {
    const SCHEMA_ID: &'static str = "reboot.response";
    const ENCODING: Encoding = Encoding::Json;

    fn to_bytes(&self) -> Result<Bytes, SchemaError> {
        json_to_bytes(self)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SchemaError> {
        json_from_bytes(data)
    }
}

/// Device-to-hub query for available firmware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    pub current_version: String,
}

impl Schema for FirmwareUpdateRequest {
    const SCHEMA_ID: &'static str = "firmware.check";
    const ENCODING: Encoding = Encoding::Json;

    fn to_bytes(&self) -> Result<Bytes, SchemaError> {
        json_to_bytes(self)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SchemaError> {
        json_from_bytes(data)
    }
}

/// Firmware decision plus the image itself, so this one is binary
#[derive(Clone, PartialEq, prost::Message)]
pub struct FirmwareUpdateResponse {
    #[prost(bool, tag = "1")]
    pub should_update: bool,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(bytes = "vec", tag = "3")]
    pub image: Vec<u8>,
}

impl Schema for FirmwareUpdateResponse {
    const SCHEMA_ID: &'static str = "firmware.decision";
    const ENCODING: Encoding = Encoding::Binary;

    fn to_bytes(&self) -> Result<Bytes, SchemaError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SchemaError> {
        Ok(FirmwareUpdateResponse::decode(data)?)
    }
}

/// A decoded payload, tagged by its schema
#[derive(Debug, Clone)]
pub enum PayloadValue {
    Reboot(RebootRequest),
    RebootStatus(RebootResponse),
    FirmwareCheck(FirmwareUpdateRequest),
    FirmwareDecision(FirmwareUpdateResponse),
}

type DecodeFn = fn(&[u8]) -> Result<PayloadValue, SchemaError>;

/// Decoders for every known schema id, keyed by the id on the wire.
///
/// New ids can be registered at runtime; registering an existing id
/// replaces its decoder.
#[derive(Default)]
pub struct SchemaRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in payload types
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(RebootRequest::SCHEMA_ID, |data| {
            Ok(PayloadValue::Reboot(RebootRequest::from_bytes(data)?))
        });
        registry.register(RebootResponse::SCHEMA_ID, |data| {
            Ok(PayloadValue::RebootStatus(RebootResponse::from_bytes(data)?))
        });
        registry.register(FirmwareUpdateRequest::SCHEMA_ID, |data| {
            Ok(PayloadValue::FirmwareCheck(FirmwareUpdateRequest::from_bytes(data)?))
        });
        registry.register(FirmwareUpdateResponse::SCHEMA_ID, |data| {
            Ok(PayloadValue::FirmwareDecision(FirmwareUpdateResponse::from_bytes(data)?))
        });
        registry
    }

    pub fn register(&mut self, schema_id: &'static str, decode: DecodeFn) {
        self.decoders.insert(schema_id, decode);
    }

    /// Decode payload bytes according to their declared schema id
    pub fn decode(&self, schema_id: &str, data: &[u8]) -> Result<PayloadValue, SchemaError> {
        match self.decoders.get(schema_id) {
            Some(decode) => decode(data),
            None => Err(SchemaError::UnknownSchema(schema_id.to_string())),
        }
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.decoders.contains_key(schema_id)
    }
}
