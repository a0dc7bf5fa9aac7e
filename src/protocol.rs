//! Wire messages exchanged with the tag.
//!
//! Payloads are bincode-encoded enums framed by the fragmenter. The core only
//! interprets the correlation id and, during the handshake, the hello
//! response's version range and extension presence; application payloads pass
//! through opaque.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Protocol version this host speaks. The tag's hello response advertises a
/// supported range that must include this value.
pub const HOST_PROTOCOL_VERSION: u32 = 2;

/// Charging state reported in a battery status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingState {
    Charging,
    NotCharging,
}

/// Battery status payload carried by responses and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub level: u8,
    pub charging: ChargingState,
}

impl BatteryStatus {
    pub fn battery_level(&self) -> u8 {
        self.level
    }

    pub fn charging_state(&self) -> ChargingState {
        self.charging
    }
}

/// Stable identity of one tag, cached per address to skip the component-info
/// round-trip on reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub product_id: u32,
    pub serial_number: String,
    pub firmware_revision: String,
}

/// Outgoing request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    /// Opens negotiation; the tag answers with its supported version range.
    Hello,
    /// Starts the session after a compatible hello exchange.
    Begin,
    /// Asks for the tag's identity (skipped when cached).
    ComponentInfo,
    /// Example application request.
    BatteryStatus,
    /// Opaque application payload forwarded untouched.
    Raw(Vec<u8>),
}

/// A correlated outgoing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub payload: RequestPayload,
}

/// Incoming response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Hello {
        min_protocol_version: u32,
        max_protocol_version: u32,
        /// Vendor extension blob; its presence gates optional features.
        extension: Option<Vec<u8>>,
    },
    Begin {
        /// Link payload size negotiated for the rest of the session.
        max_fragment_size: u16,
    },
    ComponentInfo {
        identity: DeviceIdentity,
    },
    BatteryStatus(BatteryStatus),
    /// The tag rejected the request.
    Error {
        code: u32,
        message: String,
    },
    Raw(Vec<u8>),
}

/// A correlated response from the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub payload: ResponsePayload,
}

impl Response {
    /// The battery payload, if this is a battery status response.
    pub fn battery_status(&self) -> Option<&BatteryStatus> {
        match &self.payload {
            ResponsePayload::BatteryStatus(status) => Some(status),
            _ => None,
        }
    }

    /// True when the hello response advertises an extension blob.
    pub fn has_extension(&self) -> bool {
        matches!(
            &self.payload,
            ResponsePayload::Hello {
                extension: Some(_),
                ..
            }
        )
    }

    /// Maps a tag-side error payload onto the crate error type.
    pub fn as_tag_error(&self) -> Option<Error> {
        match &self.payload {
            ResponsePayload::Error { code, message } => Some(Error::TagResponse {
                code: *code,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// Unsolicited notification payload from the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// The accessory was physically attached. Cached by the transport until
    /// the first notification observer appears, then replayed exactly once.
    Attached { component_id: u32 },
    BatteryStatus(BatteryStatus),
    Raw(Vec<u8>),
}

impl Notification {
    pub fn is_attach(&self) -> bool {
        matches!(self, Notification::Attached { .. })
    }
}

/// Encode a request for the wire.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, Error> {
    bincode::serialize(request).map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a request (test support and fakes).
pub fn decode_request(bytes: &[u8]) -> Result<Request, Error> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a reassembled response packet.
pub fn decode_response(bytes: &[u8]) -> Result<Response, Error> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Encode a response (test support and fakes).
pub fn encode_response(response: &Response) -> Result<Vec<u8>, Error> {
    bincode::serialize(response).map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a reassembled notification packet.
pub fn decode_notification(bytes: &[u8]) -> Result<Notification, Error> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Encode a notification (test support and fakes).
pub fn encode_notification(notification: &Notification) -> Result<Vec<u8>, Error> {
    bincode::serialize(notification).map_err(|e| Error::Codec(e.to_string()))
}
