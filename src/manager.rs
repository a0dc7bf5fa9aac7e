//! Connection orchestration: scanning, bonding, and per-address lifecycle.
//!
//! `TagManager` is an explicit context object; nothing here is a global.
//! Each remembered address gets one handshake machine and one public event
//! stream that survives reconnections until `forget`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cache::DeviceInfoCache;
use crate::error::Error;
use crate::handshake::HandshakeMachine;
use crate::peripheral::{BleAdapter, PairingDelegate, ScannedTag};
use crate::signal::{lock, Signal, Subscription};
use crate::tag::ConnectedTag;

/// Connection lifecycle of one address, as seen by the application. A new
/// observer immediately receives the latest event, then live updates.
#[derive(Debug, Clone)]
pub enum TagConnectionEvent {
    /// Bonding or connection setup is under way.
    Preparing,
    /// Handshake finished; the tag is ready for requests.
    Connected(Arc<ConnectedTag>),
    /// Bonding was rejected or the link could not be established.
    FailedToConnect(Error),
    Disconnected,
}

/// Publishes connection events and remembers the latest one so that late
/// observers see the current state first.
#[derive(Clone)]
pub(crate) struct EventSink {
    subject: Signal<TagConnectionEvent>,
    latest: Arc<Mutex<Option<TagConnectionEvent>>>,
}

impl EventSink {
    fn new() -> Self {
        Self {
            subject: Signal::create(),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn publish(&self, event: TagConnectionEvent) {
        *lock(&self.latest) = Some(event.clone());
        self.subject.next(event);
    }

    pub(crate) fn fail(&self, error: Error) {
        // Keep `latest` consistent with the terminal error for diagnostics.
        *lock(&self.latest) = Some(TagConnectionEvent::FailedToConnect(error.clone()));
        self.subject.error(error);
    }

    fn is_terminated(&self) -> bool {
        self.subject.is_terminated()
    }

    fn finish(&self) {
        self.subject.complete();
    }

    fn latest(&self) -> Option<TagConnectionEvent> {
        lock(&self.latest).clone()
    }

    fn stream(&self) -> Signal<TagConnectionEvent> {
        let subject = self.subject.clone();
        let latest = self.latest.clone();
        Signal::deferred(move |emitter| {
            let forward = emitter.clone();
            let on_error = emitter.clone();
            let on_complete = emitter.clone();
            let sub = subject.observe_with(
                move |event| forward.next(event),
                move |error| on_error.error(error),
                move || on_complete.complete(),
            );
            // Replay after attaching: if the subject already terminated, the
            // emitter is done and the replay is suppressed.
            if let Some(event) = lock(&latest).clone() {
                emitter.next(event);
            }
            sub
        })
    }
}

struct Entry {
    machine: HandshakeMachine,
    sink: EventSink,
    bond_sub: Subscription,
    link_sub: Subscription,
}

struct ManagerInner {
    adapter: Arc<dyn BleAdapter>,
    cache: Arc<dyn DeviceInfoCache>,
    entries: Mutex<HashMap<String, Entry>>,
    scan: Mutex<Option<Signal<ScannedTag>>>,
}

/// Owner of all per-address connection state.
#[derive(Clone)]
pub struct TagManager {
    inner: Arc<ManagerInner>,
}

impl TagManager {
    pub fn new(adapter: Arc<dyn BleAdapter>, cache: Arc<dyn DeviceInfoCache>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                adapter,
                cache,
                entries: Mutex::new(HashMap::new()),
                scan: Mutex::new(None),
            }),
        }
    }

    /// Live scan results, shared: the hardware scan starts with the first
    /// observer and stops when the last one detaches. A device seen again
    /// re-emits with its updated RSSI; a sighting with no name reuses the
    /// last name seen for that address.
    pub fn start_scan(&self) -> Result<Signal<ScannedTag>, Error> {
        if !self.inner.adapter.is_available() {
            return Err(Error::BluetoothUnavailable);
        }
        let mut slot = lock(&self.inner.scan);
        if let Some(signal) = &*slot {
            return Ok(signal.clone());
        }

        let adapter = self.inner.adapter.clone();
        let names: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let signal = Signal::deferred(move |emitter| {
            if let Err(error) = adapter.start_scan() {
                emitter.error(error);
                return Subscription::resolved();
            }
            let names = names.clone();
            let forward = emitter.clone();
            let on_error = emitter.clone();
            let sub = adapter.scan_results().observe_with(
                move |mut tag: ScannedTag| {
                    let mut names = lock(&names);
                    if tag.name.is_empty() {
                        if let Some(known) = names.get(&tag.address) {
                            tag.name = known.clone();
                        }
                    } else {
                        names.insert(tag.address.clone(), tag.name.clone());
                    }
                    forward.next(tag);
                },
                move |error| on_error.error(error),
                move || emitter.complete(),
            );
            let adapter = adapter.clone();
            Subscription::new(move || {
                sub.unsubscribe();
                adapter.stop_scan();
            })
        })
        .shared();

        *slot = Some(signal.clone());
        Ok(signal)
    }

    /// Connect to an address, bonding first if no bond exists. Returns the
    /// address's connection event stream; calling again for a known address
    /// returns the same stream and, if the link is down, retries the
    /// connection instead of creating a duplicate.
    pub fn connect(
        &self,
        address: &str,
        pairing: Arc<dyn PairingDelegate>,
    ) -> Result<Signal<TagConnectionEvent>, Error> {
        if !self.inner.adapter.is_available() {
            return Err(Error::BluetoothUnavailable);
        }

        let existing = {
            let entries = lock(&self.inner.entries);
            entries.get(address).map(|entry| {
                let concluded = matches!(
                    entry.sink.latest(),
                    Some(TagConnectionEvent::Disconnected)
                        | Some(TagConnectionEvent::FailedToConnect(_))
                );
                // A terminated stream means a handshake-fatal error; the
                // address stays down until `forget`.
                let reconnect = concluded
                    && !entry.machine.is_link_up()
                    && !entry.sink.is_terminated();
                (entry.sink.clone(), reconnect)
            })
        };
        if let Some((sink, reconnect)) = existing {
            if reconnect {
                debug!(%address, "known address, reconnecting");
                sink.publish(TagConnectionEvent::Preparing);
                self.start_connection(address, pairing);
            }
            return Ok(sink.stream());
        }

        let sink = EventSink::new();
        let machine = HandshakeMachine::new(address, self.inner.cache.clone(), sink.clone());
        lock(&self.inner.entries).insert(
            address.to_string(),
            Entry {
                machine,
                sink: sink.clone(),
                bond_sub: Subscription::resolved(),
                link_sub: Subscription::resolved(),
            },
        );
        sink.publish(TagConnectionEvent::Preparing);
        self.start_connection(address, pairing);
        Ok(sink.stream())
    }

    /// Bond if needed, then open the hardware connection.
    fn start_connection(&self, address: &str, pairing: Arc<dyn PairingDelegate>) {
        if self.inner.adapter.is_bonded(address) {
            debug!(%address, "bond exists, connecting");
            self.open_link(address);
            return;
        }

        info!(%address, "creating bond");
        let bond = self.inner.adapter.create_bond(address, pairing);
        let manager = self.clone();
        let sink = match lock(&self.inner.entries).get(address) {
            Some(entry) => entry.sink.clone(),
            None => return,
        };
        let owned = address.to_string();
        let on_error_sink = sink.clone();
        let sub = bond.observe_with(
            move |bonded| {
                if bonded {
                    manager.open_link(&owned);
                } else {
                    // User cancellation: an event, not a stream error.
                    info!(address = %owned, "bond declined");
                    sink.publish(TagConnectionEvent::FailedToConnect(Error::BondingFailed(
                        owned.clone(),
                    )));
                }
            },
            move |error| {
                on_error_sink.publish(TagConnectionEvent::FailedToConnect(error));
            },
            || {},
        );
        if let Some(entry) = lock(&self.inner.entries).get_mut(address) {
            entry.bond_sub.unsubscribe();
            entry.bond_sub = sub;
        } else {
            sub.unsubscribe();
        }
    }

    fn open_link(&self, address: &str) {
        // Retire the previous link subscription first so a reconnect never
        // delivers events to the machine twice.
        let machine = {
            let mut entries = lock(&self.inner.entries);
            let Some(entry) = entries.get_mut(address) else { return };
            let old = std::mem::replace(&mut entry.link_sub, Subscription::resolved());
            let machine = entry.machine.clone();
            drop(entries);
            old.unsubscribe();
            machine
        };
        let events = self.inner.adapter.connect(address);
        let on_event = machine.clone();
        let sub = events.observe_with(
            move |event| on_event.on_event(event),
            move |error| machine.on_link_error(error),
            || {},
        );
        if let Some(entry) = lock(&self.inner.entries).get_mut(address) {
            entry.link_sub.unsubscribe();
            entry.link_sub = sub;
        } else {
            sub.unsubscribe();
        }
    }

    /// Drop everything known about an address. The public stream completes.
    /// Unknown addresses are a no-op.
    pub fn forget(&self, address: &str) {
        let entry = lock(&self.inner.entries).remove(address);
        let Some(entry) = entry else { return };
        entry.bond_sub.unsubscribe();
        entry.link_sub.unsubscribe();
        entry.machine.teardown();
        self.inner.adapter.disconnect(address);
        entry.sink.finish();
        info!(%address, "forgotten");
    }

    /// Forget every address and release scan resources.
    pub fn destroy(&self) {
        let addresses: Vec<String> = lock(&self.inner.entries).keys().cloned().collect();
        for address in addresses {
            self.forget(&address);
        }
        lock(&self.inner.scan).take();
        self.inner.adapter.stop_scan();
        info!("manager destroyed");
    }

    /// Machine phase for an address, if known. Diagnostic surface.
    pub fn handshake_phase(&self, address: &str) -> Option<crate::handshake::HandshakePhase> {
        lock(&self.inner.entries)
            .get(address)
            .map(|entry| entry.machine.phase())
    }
}
