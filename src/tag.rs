//! Application-facing handle to a tag that finished its handshake.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::peripheral::{ConnectionPriority, Peripheral, WriteMode};
use crate::protocol::{DeviceIdentity, Notification, RequestPayload, Response};
use crate::signal::Signal;
use crate::transport::Transport;

/// A tag whose session is established. Created by the handshake and handed
/// out on the connection event stream; all I/O goes through the transport it
/// wraps.
pub struct ConnectedTag {
    identity: DeviceIdentity,
    peripheral: Arc<dyn Peripheral>,
    transport: Transport,
}

impl ConnectedTag {
    pub(crate) fn new(
        identity: DeviceIdentity,
        peripheral: Arc<dyn Peripheral>,
        transport: Transport,
    ) -> Self {
        Self {
            identity,
            peripheral,
            transport,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn address(&self) -> String {
        self.peripheral.address()
    }

    pub fn name(&self) -> Option<String> {
        self.peripheral.name()
    }

    /// Send a request with the default retry and timeout policy. The returned
    /// signal delivers the response and completes.
    pub fn enqueue(&self, payload: RequestPayload) -> Signal<Response> {
        self.transport.enqueue_default(payload)
    }

    /// Send a request with explicit policy.
    pub fn enqueue_with(
        &self,
        payload: RequestPayload,
        write_mode: WriteMode,
        retries: u32,
        timeout: Duration,
    ) -> Signal<Response> {
        self.transport.enqueue(payload, write_mode, retries, timeout)
    }

    /// Unsolicited notifications from the tag.
    pub fn notifications(&self) -> Signal<Notification> {
        self.transport.notifications()
    }

    /// Reassembled packets from the raw-data channel.
    pub fn raw_data(&self) -> Signal<Vec<u8>> {
        self.transport.raw_data()
    }

    /// Send one packet on the raw-data channel.
    pub fn send_raw_data(&self, payload: &[u8]) -> Result<()> {
        self.transport.send_raw_data(payload)
    }

    /// RSSI readings, polled while observed.
    pub fn rssi_values(&self) -> Signal<i32> {
        self.transport.rssi_values()
    }

    /// Cancel RSSI polling explicitly.
    pub fn stop_rssi(&self) {
        self.transport.stop_rssi()
    }

    pub fn request_connection_priority(&self, priority: ConnectionPriority) {
        self.transport.request_connection_priority(priority)
    }
}

impl fmt::Debug for ConnectedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedTag")
            .field("address", &self.peripheral.address())
            .field("serial_number", &self.identity.serial_number)
            .finish()
    }
}
