//! Capability surface over the wireless link.
//!
//! The platform BLE stack only offers callbacks; everything behind
//! [`BleAdapter`] and [`Peripheral`] is an adapter converting those callbacks
//! into pushes on the crate's [`Signal`](crate::signal::Signal) primitive.
//! Tests drive the same contract through `testkit` fakes.

use std::fmt;
use std::sync::Arc;

use crate::signal::Signal;

/// Identifier of one GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId(pub u16);

/// Channel carrying requests out and responses back.
pub const COMMAND_CHANNEL: CharacteristicId = CharacteristicId(0x0101);
/// Channel carrying unsolicited notifications from the tag.
pub const NOTIFY_CHANNEL: CharacteristicId = CharacteristicId(0x0102);
/// Channel carrying sequence-numbered, ack'd bulk data.
pub const RAW_DATA_CHANNEL: CharacteristicId = CharacteristicId(0x0103);

/// Link-layer write mode for a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Application-level acknowledgement requested from the link.
    WithResponse,
    /// Only the link's own ack covers delivery.
    WithoutResponse,
}

/// Requested connection priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// One discovered GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub id: u16,
    pub characteristics: Vec<CharacteristicId>,
}

/// A characteristic value change reported by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicUpdate {
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

/// Thin handle over one connected peripheral. Every method returns whether
/// the operation was *accepted for dispatch*; actual completion arrives
/// asynchronously as a [`ConnectionState`] event. All access must be
/// serialized through a [`CommandQueue`](crate::queue::CommandQueue).
pub trait Peripheral: Send + Sync {
    /// Stable address identifying this physical device.
    fn address(&self) -> String;

    /// Advertised device name, if any.
    fn name(&self) -> Option<String>;

    fn read_characteristic(&self, id: CharacteristicId) -> bool;

    fn write_characteristic(&self, id: CharacteristicId, mode: WriteMode, value: &[u8]) -> bool;

    fn write_descriptor(&self, id: CharacteristicId, value: &[u8]) -> bool;

    fn enable_notification(&self, id: CharacteristicId, enabled: bool) -> bool;

    fn discover_services(&self) -> bool;

    fn request_rssi(&self) -> bool;

    fn request_connection_priority(&self, priority: ConnectionPriority) -> bool;
}

/// Per-device connection lifecycle event. Exactly one variant is active;
/// consumers match exhaustively.
#[derive(Clone)]
pub enum ConnectionState {
    Connected(Arc<dyn Peripheral>),
    FailedToConnect(Arc<dyn Peripheral>, crate::error::Error),
    Disconnected(Arc<dyn Peripheral>),
    ServicesDiscovered(Arc<dyn Peripheral>, Vec<GattService>),
    CharacteristicUpdated(Arc<dyn Peripheral>, CharacteristicUpdate),
    ValueWritten(Arc<dyn Peripheral>, CharacteristicId),
    RssiUpdated(Arc<dyn Peripheral>, i32),
}

impl ConnectionState {
    /// The peripheral this event belongs to.
    pub fn peripheral(&self) -> &Arc<dyn Peripheral> {
        match self {
            ConnectionState::Connected(p)
            | ConnectionState::FailedToConnect(p, _)
            | ConnectionState::Disconnected(p)
            | ConnectionState::ServicesDiscovered(p, _)
            | ConnectionState::CharacteristicUpdated(p, _)
            | ConnectionState::ValueWritten(p, _)
            | ConnectionState::RssiUpdated(p, _) => p,
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.peripheral().address();
        match self {
            ConnectionState::Connected(_) => write!(f, "Connected({address})"),
            ConnectionState::FailedToConnect(_, e) => {
                write!(f, "FailedToConnect({address}, {e})")
            }
            ConnectionState::Disconnected(_) => write!(f, "Disconnected({address})"),
            ConnectionState::ServicesDiscovered(_, services) => {
                write!(f, "ServicesDiscovered({address}, {} services)", services.len())
            }
            ConnectionState::CharacteristicUpdated(_, update) => write!(
                f,
                "CharacteristicUpdated({address}, {:#06x}, {} bytes)",
                update.characteristic.0,
                update.value.len()
            ),
            ConnectionState::ValueWritten(_, id) => {
                write!(f, "ValueWritten({address}, {:#06x})", id.0)
            }
            ConnectionState::RssiUpdated(_, rssi) => write!(f, "RssiUpdated({address}, {rssi})"),
        }
    }
}

/// A peripheral seen during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedTag {
    pub name: String,
    pub address: String,
    pub rssi: i32,
}

/// Callback surface for interactive pairing. On platforms with out-of-band
/// device association the adapter hands the caller an opaque consent token
/// when user interaction is required.
pub trait PairingDelegate: Send + Sync {
    /// User interaction is required; present the consent token.
    fn on_consent_required(&self, token: &str);
}

/// No-op delegate for platforms where bonding never prompts.
pub struct SilentPairing;

impl PairingDelegate for SilentPairing {
    fn on_consent_required(&self, _token: &str) {}
}

/// The seam between the platform BLE stack and the core: converts scattered
/// hardware callbacks into signals.
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is present and enabled.
    fn is_available(&self) -> bool;

    /// Ask the hardware to start advertising discovery. Results arrive on
    /// [`BleAdapter::scan_results`].
    fn start_scan(&self) -> Result<(), crate::error::Error>;

    fn stop_scan(&self);

    /// Live stream of raw advertisement sightings.
    fn scan_results(&self) -> Signal<ScannedTag>;

    /// Whether a bond for this address already exists.
    fn is_bonded(&self, address: &str) -> bool;

    /// Create a bond. Emits exactly one `bool` and completes: `false` means
    /// the user cancelled or rejected; errors are reserved for stack faults.
    fn create_bond(&self, address: &str, pairing: Arc<dyn PairingDelegate>) -> Signal<bool>;

    /// Open the hardware-level connection. The returned stream carries this
    /// address's [`ConnectionState`] events until the connection handle is
    /// released. A radio power-off must surface as an immediate
    /// `Disconnected` event on this stream.
    fn connect(&self, address: &str) -> Signal<ConnectionState>;

    /// Release the hardware connection handle for this address.
    fn disconnect(&self, address: &str);
}
