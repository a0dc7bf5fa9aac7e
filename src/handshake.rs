//! Session negotiation state machine.
//!
//! Runs once per hardware connection: hello (version check), a short settle
//! delay, begin (fragment size), component info (skipped when the identity is
//! cached), then the connected tag handle is published. Events arriving in a
//! terminal phase are ignored. An incompatible version range stalls the
//! machine rather than erroring; the caller sees no progress and owns any
//! give-up policy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::DeviceInfoCache;
use crate::error::Error;
use crate::manager::{EventSink, TagConnectionEvent};
use crate::peripheral::{ConnectionState, Peripheral, WriteMode};
use crate::protocol::{
    DeviceIdentity, RequestPayload, Response, ResponsePayload, HOST_PROTOCOL_VERSION,
};
use crate::queue::CommandQueue;
use crate::signal::lock;
use crate::tag::ConnectedTag;
use crate::transport::{Transport, DEFAULT_REQUEST_TIMEOUT};

/// Resend budget for each negotiation request.
pub const HANDSHAKE_RETRIES: u32 = 2;

/// Pause between a compatible hello response and the begin request; some
/// firmware revisions drop writes arriving straight after their hello.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Negotiation phase. `TagInitialized` and `Error` are terminal for
/// negotiation; a disconnect resets a non-errored machine to `Paired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Paired,
    HelloSent,
    BeginSent,
    ComponentInfoSent,
    CreatingTagInstance,
    TagInitialized,
    Error,
}

impl HandshakePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakePhase::TagInitialized | HandshakePhase::Error)
    }
}

struct MachineState {
    phase: HandshakePhase,
    link_up: bool,
    torn_down: bool,
    transport: Option<Transport>,
}

struct MachineInner {
    address: String,
    cache: Arc<dyn DeviceInfoCache>,
    sink: EventSink,
    state: Mutex<MachineState>,
}

/// One machine per remembered address; survives reconnections.
#[derive(Clone)]
pub struct HandshakeMachine {
    inner: Arc<MachineInner>,
}

impl HandshakeMachine {
    pub fn new(address: &str, cache: Arc<dyn DeviceInfoCache>, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(MachineInner {
                address: address.to_string(),
                cache,
                sink,
                state: Mutex::new(MachineState {
                    phase: HandshakePhase::Paired,
                    link_up: false,
                    torn_down: false,
                    transport: None,
                }),
            }),
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        lock(&self.inner.state).phase
    }

    /// Whether the hardware link is currently up.
    pub fn is_link_up(&self) -> bool {
        lock(&self.inner.state).link_up
    }

    /// The transport, once a connection produced one.
    pub fn transport(&self) -> Option<Transport> {
        lock(&self.inner.state).transport.clone()
    }

    /// Entry point for every hardware event of this address.
    pub fn on_event(&self, event: ConnectionState) {
        if lock(&self.inner.state).torn_down {
            return;
        }
        match event {
            ConnectionState::Connected(peripheral) => self.on_connected(peripheral),
            ConnectionState::FailedToConnect(_, error) => self.on_failed_to_connect(error),
            ConnectionState::Disconnected(_) => self.on_disconnected(),
            ConnectionState::ServicesDiscovered(_, _) => {
                if let Some(transport) = self.transport() {
                    transport.handle_event(&event);
                }
                self.on_services_discovered();
            }
            other => {
                if let Some(transport) = self.transport() {
                    transport.handle_event(&other);
                }
            }
        }
    }

    /// The hardware event stream itself failed; treated like a failed
    /// connection attempt.
    pub fn on_link_error(&self, error: Error) {
        if lock(&self.inner.state).torn_down {
            return;
        }
        self.on_failed_to_connect(error);
    }

    /// Permanently disable the machine. Called by the manager on forget.
    pub fn teardown(&self) {
        let transport = {
            let mut state = lock(&self.inner.state);
            state.torn_down = true;
            state.link_up = false;
            state.transport.take()
        };
        if let Some(transport) = transport {
            transport.discard();
        }
    }

    fn on_connected(&self, peripheral: Arc<dyn Peripheral>) {
        let transport = {
            let mut state = lock(&self.inner.state);
            if state.phase == HandshakePhase::Error {
                return;
            }
            state.link_up = true;
            state.phase = HandshakePhase::Paired;
            let transport = Transport::new(peripheral, CommandQueue::new());
            state.transport = Some(transport.clone());
            transport
        };
        debug!(address = %self.inner.address, "link up, discovering services");
        transport.discover_services();
    }

    fn on_failed_to_connect(&self, error: Error) {
        {
            let mut state = lock(&self.inner.state);
            state.link_up = false;
            if state.phase != HandshakePhase::Error {
                state.phase = HandshakePhase::Paired;
            }
        }
        warn!(address = %self.inner.address, %error, "connection failed");
        self.inner
            .sink
            .publish(TagConnectionEvent::FailedToConnect(error));
    }

    fn on_disconnected(&self) {
        let transport = {
            let mut state = lock(&self.inner.state);
            state.link_up = false;
            if state.phase != HandshakePhase::Error {
                state.phase = HandshakePhase::Paired;
            }
            state.transport.take()
        };
        if let Some(transport) = transport {
            transport.discard();
        }
        info!(address = %self.inner.address, "disconnected");
        self.inner.sink.publish(TagConnectionEvent::Disconnected);
    }

    fn on_services_discovered(&self) {
        let transport = {
            let mut state = lock(&self.inner.state);
            if state.phase != HandshakePhase::Paired || !state.link_up {
                return;
            }
            state.phase = HandshakePhase::HelloSent;
            match &state.transport {
                Some(transport) => transport.clone(),
                None => return,
            }
        };
        transport.enable_channel_notifications();

        debug!(address = %self.inner.address, "sending hello");
        let sink = transport.enqueue(
            RequestPayload::Hello,
            WriteMode::WithoutResponse,
            HANDSHAKE_RETRIES,
            DEFAULT_REQUEST_TIMEOUT,
        );
        let on_next = self.clone();
        let on_error = self.clone();
        sink.observe_with(
            move |response| on_next.on_hello_response(response),
            move |error| on_error.fail(error),
            || {},
        );
    }

    fn on_hello_response(&self, response: Response) {
        if self.phase() != HandshakePhase::HelloSent {
            return;
        }
        if let Some(error) = response.as_tag_error() {
            self.fail(error);
            return;
        }
        match response.payload {
            ResponsePayload::Hello {
                min_protocol_version,
                max_protocol_version,
                ..
            } => {
                let compatible = (min_protocol_version..=max_protocol_version)
                    .contains(&HOST_PROTOCOL_VERSION);
                if !compatible {
                    // Stall: no further progress, no error. The tag keeps its
                    // link; the caller decides whether to give up.
                    warn!(
                        address = %self.inner.address,
                        min = min_protocol_version,
                        max = max_protocol_version,
                        host = HOST_PROTOCOL_VERSION,
                        "protocol version out of range, handshake stalled"
                    );
                    return;
                }
                let machine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SETTLE_DELAY).await;
                    machine.send_begin();
                });
            }
            _ => self.fail(Error::Handshake("unexpected reply to hello".into())),
        }
    }

    fn send_begin(&self) {
        let transport = {
            let mut state = lock(&self.inner.state);
            if state.torn_down || state.phase != HandshakePhase::HelloSent {
                return;
            }
            state.phase = HandshakePhase::BeginSent;
            match &state.transport {
                Some(transport) => transport.clone(),
                None => return,
            }
        };
        debug!(address = %self.inner.address, "sending begin");
        let sink = transport.enqueue(
            RequestPayload::Begin,
            WriteMode::WithoutResponse,
            HANDSHAKE_RETRIES,
            DEFAULT_REQUEST_TIMEOUT,
        );
        let on_next = self.clone();
        let on_error = self.clone();
        sink.observe_with(
            move |response| on_next.on_begin_response(response),
            move |error| on_error.fail(error),
            || {},
        );
    }

    fn on_begin_response(&self, response: Response) {
        if self.phase() != HandshakePhase::BeginSent {
            return;
        }
        if let Some(error) = response.as_tag_error() {
            self.fail(error);
            return;
        }
        let transport = match self.transport() {
            Some(transport) => transport,
            None => return,
        };
        match response.payload {
            ResponsePayload::Begin { max_fragment_size } => {
                transport.set_max_fragment_size(max_fragment_size as usize);
            }
            _ => {
                self.fail(Error::Handshake("unexpected reply to begin".into()));
                return;
            }
        }

        if let Some(identity) = self.inner.cache.get(&self.inner.address) {
            debug!(address = %self.inner.address, "identity cached, skipping component info");
            self.create_tag(identity);
            return;
        }

        {
            let mut state = lock(&self.inner.state);
            if state.phase != HandshakePhase::BeginSent {
                return;
            }
            state.phase = HandshakePhase::ComponentInfoSent;
        }
        debug!(address = %self.inner.address, "requesting component info");
        let sink = transport.enqueue(
            RequestPayload::ComponentInfo,
            WriteMode::WithoutResponse,
            HANDSHAKE_RETRIES,
            DEFAULT_REQUEST_TIMEOUT,
        );
        let on_next = self.clone();
        let on_error = self.clone();
        sink.observe_with(
            move |response| on_next.on_component_info_response(response),
            move |error| on_error.fail(error),
            || {},
        );
    }

    fn on_component_info_response(&self, response: Response) {
        if self.phase() != HandshakePhase::ComponentInfoSent {
            return;
        }
        if let Some(error) = response.as_tag_error() {
            self.fail(error);
            return;
        }
        match response.payload {
            ResponsePayload::ComponentInfo { identity } => {
                self.inner.cache.put(&self.inner.address, identity.clone());
                self.create_tag(identity);
            }
            _ => self.fail(Error::Handshake("unexpected reply to component info".into())),
        }
    }

    fn create_tag(&self, identity: DeviceIdentity) {
        let transport = {
            let mut state = lock(&self.inner.state);
            if state.torn_down || state.phase.is_terminal() {
                return;
            }
            state.phase = HandshakePhase::CreatingTagInstance;
            match &state.transport {
                Some(transport) => transport.clone(),
                None => return,
            }
        };
        let peripheral = transport.peripheral().clone();
        let tag = Arc::new(ConnectedTag::new(identity, peripheral, transport));
        lock(&self.inner.state).phase = HandshakePhase::TagInitialized;
        info!(address = %self.inner.address, "tag initialized");
        self.inner.sink.publish(TagConnectionEvent::Connected(tag));
    }

    fn fail(&self, error: Error) {
        // Transport closure is reported by the disconnect event itself.
        if matches!(error, Error::TransportClosed) {
            debug!(address = %self.inner.address, "request cancelled by closure");
            return;
        }
        {
            let mut state = lock(&self.inner.state);
            if state.torn_down || state.phase == HandshakePhase::Error {
                return;
            }
            state.phase = HandshakePhase::Error;
        }
        warn!(address = %self.inner.address, %error, "handshake failed");
        self.inner.sink.fail(error);
    }
}
