//! In-memory fakes of the hardware seam.
//!
//! `FakePeripheral` and `FakeBleAdapter` drive the whole stack without a
//! radio: writes are recorded, completions and updates are injected by the
//! test, and everything runs on the caller's thread in deterministic order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::Error;
use crate::fragment::{Fragmenter, RawFragment, Reassembler, DEFAULT_MAX_FRAGMENT};
use crate::peripheral::{
    BleAdapter, CharacteristicId, CharacteristicUpdate, ConnectionPriority, ConnectionState,
    GattService, PairingDelegate, Peripheral, ScannedTag, WriteMode, COMMAND_CHANNEL,
    NOTIFY_CHANNEL, RAW_DATA_CHANNEL,
};
use crate::protocol::{
    encode_notification, encode_response, Notification, Request, Response, ResponsePayload,
};
use crate::signal::{lock, Signal};

/// One recorded characteristic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub characteristic: CharacteristicId,
    pub mode: WriteMode,
    pub value: Vec<u8>,
}

/// Scriptable peripheral. By default every write is accepted and completes
/// synchronously with a value-written event, and service discovery succeeds
/// immediately.
pub struct FakePeripheral {
    weak: Weak<FakePeripheral>,
    address: String,
    name: Option<String>,
    events: Signal<ConnectionState>,
    writes: Mutex<Vec<RecordedWrite>>,
    reject_next_writes: AtomicU32,
    write_attempts: AtomicU32,
    rejected_attempts: Mutex<HashSet<u32>>,
    auto_complete_writes: AtomicBool,
    auto_discover: AtomicBool,
    auto_rssi: Mutex<Option<i32>>,
    rssi_requests: AtomicU32,
}

impl FakePeripheral {
    pub fn new(address: &str, name: Option<&str>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            address: address.to_string(),
            name: name.map(str::to_string),
            events: Signal::create(),
            writes: Mutex::new(Vec::new()),
            reject_next_writes: AtomicU32::new(0),
            write_attempts: AtomicU32::new(0),
            rejected_attempts: Mutex::new(HashSet::new()),
            auto_complete_writes: AtomicBool::new(true),
            auto_discover: AtomicBool::new(true),
            auto_rssi: Mutex::new(None),
            rssi_requests: AtomicU32::new(0),
        })
    }

    fn me(&self) -> Arc<dyn Peripheral> {
        self.weak.upgrade().expect("fake peripheral dropped")
    }

    /// The raw event stream, as `BleAdapter::connect` would hand it out.
    pub fn events(&self) -> Signal<ConnectionState> {
        self.events.clone()
    }

    /// Reject the next `count` characteristic writes.
    pub fn reject_next_writes(&self, count: u32) {
        self.reject_next_writes.store(count, Ordering::SeqCst);
    }

    /// Reject the `nth` characteristic write attempt from now (1-based),
    /// accepting the ones before and after it.
    pub fn reject_write_nth(&self, nth: u32) {
        let base = self.write_attempts.load(Ordering::SeqCst);
        lock(&self.rejected_attempts).insert(base + nth);
    }

    /// Stop emitting automatic value-written completions; the test pushes
    /// them itself via [`FakePeripheral::push_value_written`].
    pub fn set_auto_complete_writes(&self, enabled: bool) {
        self.auto_complete_writes.store(enabled, Ordering::SeqCst);
    }

    /// Answer every RSSI request immediately with this value.
    pub fn set_rssi(&self, value: i32) {
        *lock(&self.auto_rssi) = Some(value);
    }

    pub fn rssi_request_count(&self) -> u32 {
        self.rssi_requests.load(Ordering::SeqCst)
    }

    /// Everything written so far, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.writes).clone()
    }

    /// Writes to one characteristic, values only.
    pub fn writes_to(&self, characteristic: CharacteristicId) -> Vec<Vec<u8>> {
        lock(&self.writes)
            .iter()
            .filter(|write| write.characteristic == characteristic)
            .map(|write| write.value.clone())
            .collect()
    }

    /// Reassemble and decode every request written to the command channel.
    pub fn sent_requests(&self) -> Vec<Request> {
        let mut assembler = Reassembler::new();
        let mut requests = Vec::new();
        for fragment in self.writes_to(COMMAND_CHANNEL) {
            if let Ok(Some(packet)) = assembler.push(&fragment) {
                if let Ok(request) = crate::protocol::decode_request(&packet) {
                    requests.push(request);
                }
            }
        }
        requests
    }

    pub fn push_value_written(&self, characteristic: CharacteristicId) {
        self.events
            .next(ConnectionState::ValueWritten(self.me(), characteristic));
    }

    pub fn push_update(&self, characteristic: CharacteristicId, value: Vec<u8>) {
        self.events.next(ConnectionState::CharacteristicUpdated(
            self.me(),
            CharacteristicUpdate {
                characteristic,
                value,
            },
        ));
    }

    pub fn push_rssi(&self, value: i32) {
        self.events
            .next(ConnectionState::RssiUpdated(self.me(), value));
    }

    pub fn push_disconnected(&self) {
        self.events.next(ConnectionState::Disconnected(self.me()));
    }

    /// Encode, fragment, and deliver a response on the command channel.
    pub fn respond(&self, id: u32, payload: ResponsePayload) {
        let bytes = encode_response(&Response { id, payload }).expect("response encodes");
        let fragments = Fragmenter::new(DEFAULT_MAX_FRAGMENT)
            .fragment(&bytes)
            .expect("response fits the framing");
        for fragment in fragments {
            self.push_update(COMMAND_CHANNEL, fragment);
        }
    }

    /// Encode, fragment, and deliver a notification.
    pub fn notify(&self, notification: Notification) {
        let bytes = encode_notification(&notification).expect("notification encodes");
        let fragments = Fragmenter::new(DEFAULT_MAX_FRAGMENT)
            .fragment(&bytes)
            .expect("notification fits the framing");
        for fragment in fragments {
            self.push_update(NOTIFY_CHANNEL, fragment);
        }
    }

    /// Deliver one packet on the raw-data channel under sequence `seq`.
    pub fn push_raw_packet(&self, seq: u8, payload: &[u8]) {
        let inner_max = DEFAULT_MAX_FRAGMENT - 2;
        let fragments = Fragmenter::new(inner_max)
            .fragment(payload)
            .expect("raw payload fits the framing");
        for inner in fragments {
            let bytes = RawFragment {
                seq,
                ack: false,
                inner,
            }
            .encode();
            self.push_update(RAW_DATA_CHANNEL, bytes);
        }
    }
}

impl Peripheral for FakePeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn read_characteristic(&self, _id: CharacteristicId) -> bool {
        true
    }

    fn write_characteristic(&self, id: CharacteristicId, mode: WriteMode, value: &[u8]) -> bool {
        let attempt = self.write_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if lock(&self.rejected_attempts).remove(&attempt) {
            return false;
        }
        let pending = self.reject_next_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_next_writes.store(pending - 1, Ordering::SeqCst);
            return false;
        }
        lock(&self.writes).push(RecordedWrite {
            characteristic: id,
            mode,
            value: value.to_vec(),
        });
        if self.auto_complete_writes.load(Ordering::SeqCst) {
            self.push_value_written(id);
        }
        true
    }

    fn write_descriptor(&self, id: CharacteristicId, _value: &[u8]) -> bool {
        if self.auto_complete_writes.load(Ordering::SeqCst) {
            self.push_value_written(id);
        }
        true
    }

    fn enable_notification(&self, id: CharacteristicId, _enabled: bool) -> bool {
        if self.auto_complete_writes.load(Ordering::SeqCst) {
            self.push_value_written(id);
        }
        true
    }

    fn discover_services(&self) -> bool {
        if self.auto_discover.load(Ordering::SeqCst) {
            let services = vec![GattService {
                id: 0x0100,
                characteristics: vec![COMMAND_CHANNEL, NOTIFY_CHANNEL, RAW_DATA_CHANNEL],
            }];
            self.events
                .next(ConnectionState::ServicesDiscovered(self.me(), services));
        }
        true
    }

    fn request_rssi(&self) -> bool {
        self.rssi_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(value) = *lock(&self.auto_rssi) {
            self.push_rssi(value);
        }
        true
    }

    fn request_connection_priority(&self, _priority: ConnectionPriority) -> bool {
        true
    }
}

/// Scriptable adapter. Bonds succeed by default; connections hand out one
/// [`FakePeripheral`] per address, created on first use.
pub struct FakeBleAdapter {
    available: AtomicBool,
    scan_subject: Signal<ScannedTag>,
    scanning: AtomicBool,
    scan_starts: AtomicU32,
    bonded: Mutex<HashSet<String>>,
    bond_outcomes: Mutex<HashMap<String, bool>>,
    peripherals: Mutex<HashMap<String, Arc<FakePeripheral>>>,
    disconnects: Mutex<Vec<String>>,
}

impl Default for FakeBleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBleAdapter {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            scan_subject: Signal::create(),
            scanning: AtomicBool::new(false),
            scan_starts: AtomicU32::new(0),
            bonded: Mutex::new(HashSet::new()),
            bond_outcomes: Mutex::new(HashMap::new()),
            peripherals: Mutex::new(HashMap::new()),
            disconnects: Mutex::new(Vec::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Script the outcome of the next bond for this address. Unscripted
    /// addresses bond successfully.
    pub fn set_bond_outcome(&self, address: &str, accepted: bool) {
        lock(&self.bond_outcomes).insert(address.to_string(), accepted);
    }

    pub fn mark_bonded(&self, address: &str) {
        lock(&self.bonded).insert(address.to_string());
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn scan_start_count(&self) -> u32 {
        self.scan_starts.load(Ordering::SeqCst)
    }

    /// Inject one advertisement sighting.
    pub fn push_scan_result(&self, name: &str, address: &str, rssi: i32) {
        self.scan_subject.next(ScannedTag {
            name: name.to_string(),
            address: address.to_string(),
            rssi,
        });
    }

    /// The peripheral backing an address, created on first use.
    pub fn peripheral(&self, address: &str) -> Arc<FakePeripheral> {
        lock(&self.peripherals)
            .entry(address.to_string())
            .or_insert_with(|| FakePeripheral::new(address, Some("fake tag")))
            .clone()
    }

    pub fn disconnect_log(&self) -> Vec<String> {
        lock(&self.disconnects).clone()
    }
}

impl BleAdapter for FakeBleAdapter {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn start_scan(&self) -> Result<(), Error> {
        if !self.is_available() {
            return Err(Error::BluetoothUnavailable);
        }
        self.scanning.store(true, Ordering::SeqCst);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_scan(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }

    fn scan_results(&self) -> Signal<ScannedTag> {
        self.scan_subject.clone()
    }

    fn is_bonded(&self, address: &str) -> bool {
        lock(&self.bonded).contains(address)
    }

    fn create_bond(&self, address: &str, _pairing: Arc<dyn PairingDelegate>) -> Signal<bool> {
        let accepted = lock(&self.bond_outcomes)
            .get(address)
            .copied()
            .unwrap_or(true);
        if accepted {
            lock(&self.bonded).insert(address.to_string());
        }
        Signal::just(accepted)
    }

    fn connect(&self, address: &str) -> Signal<ConnectionState> {
        let peripheral = self.peripheral(address);
        let events = peripheral.events();
        Signal::deferred(move |emitter| {
            let forward = emitter.clone();
            let on_error = emitter.clone();
            let sub = events.observe_with(
                move |event| forward.next(event),
                move |error| on_error.error(error),
                {
                    let emitter = emitter.clone();
                    move || emitter.complete()
                },
            );
            emitter.next(ConnectionState::Connected(peripheral.clone() as Arc<dyn Peripheral>));
            sub
        })
    }

    fn disconnect(&self, address: &str) {
        lock(&self.disconnects).push(address.to_string());
    }
}
