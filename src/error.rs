//! Crate-wide error type.
//!
//! Errors travel through [`Signal`](crate::signal::Signal) error channels and
//! may be delivered to several observers, so the type is `Clone` and carries
//! owned data only.

use std::time::Duration;

/// Error type for all taglink operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The radio is missing or disabled. Surfaced on the very first call,
    /// before any per-address state is touched.
    #[error("bluetooth radio unavailable")]
    BluetoothUnavailable,

    /// No peripheral with the given address is known to the adapter.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Bonding was rejected by the platform (user cancellation is reported
    /// as a `false` bond result instead, never as this error).
    #[error("bonding failed for {0}")]
    BondingFailed(String),

    /// No response arrived within the request's timeout window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A single characteristic write was not accepted for dispatch.
    #[error("characteristic write rejected by the link")]
    WriteRejected,

    /// A queued fragment write belonged to an attempt that has since been
    /// retried or resolved; it was skipped.
    #[error("write superseded by a newer attempt")]
    SupersededWrite,

    /// A characteristic write was rejected by the link and all retries
    /// were used up.
    #[error("write failed after {attempts} attempts on {address}")]
    RetriesExhausted { address: String, attempts: u32 },

    /// The tag answered a request with an error payload.
    #[error("tag error response: code {code}: {message}")]
    TagResponse { code: u32, message: String },

    /// Handshake negotiation ended in its terminal error state.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A continuation fragment arrived without a preceding first fragment,
    /// or fragments arrived out of order.
    #[error("fragment sequence error")]
    FragmentSequence,

    /// A packet was larger than the u16 length header can announce, or more
    /// payload arrived than the first fragment announced.
    #[error("fragment length overflow")]
    FragmentOverflow,

    /// The transport was discarded while the request was still queued.
    #[error("transport closed")]
    TransportClosed,

    /// Static configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for errors the transport may retry before surfacing.
    pub fn is_transport_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::RetriesExhausted { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
