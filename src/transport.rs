//! Request/response plumbing over a connected peripheral.
//!
//! One transport instance lives exactly as long as one hardware connection.
//! Outgoing requests are FIFO with at most one in flight; the response channel
//! correlates by request id. Notifications, raw data, and RSSI each get their
//! own stream. Every byte that leaves the host goes through the
//! [`CommandQueue`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::fragment::{Fragmenter, RawFragment, Reassembler, DEFAULT_MAX_FRAGMENT};
use crate::peripheral::{
    CharacteristicUpdate, ConnectionPriority, ConnectionState, Peripheral, WriteMode,
    COMMAND_CHANNEL, NOTIFY_CHANNEL, RAW_DATA_CHANNEL,
};
use crate::protocol::{
    decode_notification, decode_response, encode_request, Notification, Request, RequestPayload,
    Response,
};
use crate::queue::{Command, CommandKind, CommandQueue};
use crate::signal::{lock, Signal, Subscription};

/// Deadline for a request's whole send-to-response span.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(8000);
/// Resend attempts after the initial write of a request fails.
pub const DEFAULT_REQUEST_RETRIES: u32 = 2;

const RSSI_POLL_DELAY: Duration = Duration::from_secs(1);
const RSSI_POLL_PERIOD: Duration = Duration::from_secs(1);

struct PendingRequest {
    payload: RequestPayload,
    write_mode: WriteMode,
    retries: u32,
    timeout: Duration,
    sink: Signal<Response>,
}

struct InFlight {
    id: u32,
    payload: RequestPayload,
    write_mode: WriteMode,
    /// Resends still allowed after a rejected write.
    retries_left: u32,
    /// Bumped on every resend so queued fragments of a failed attempt are
    /// skipped instead of written.
    attempt: u32,
    timeout: Duration,
    timeout_task: Option<JoinHandle<()>>,
    /// Unique across the transport's life; guards the timeout task.
    generation: u64,
    sink: Signal<Response>,
}

struct SendState {
    pending: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
    next_id: u32,
    next_generation: u64,
    fragmenter: Fragmenter,
    assembler: Reassembler,
    closed: bool,
}

struct NotifyState {
    assembler: Reassembler,
    observers: usize,
    /// Attach notification seen before any observer existed.
    cached_attach: Option<Notification>,
    /// Cleared forever once the first observer has attached.
    cache_armed: bool,
}

struct RawState {
    assembler: Reassembler,
    observers: usize,
    next_seq: u8,
}

struct RssiState {
    observers: usize,
    task: Option<JoinHandle<()>>,
}

struct TransportInner {
    peripheral: Arc<dyn Peripheral>,
    queue: CommandQueue,
    send: Mutex<SendState>,
    notify: Mutex<NotifyState>,
    raw: Mutex<RawState>,
    rssi: Mutex<RssiState>,
    notify_subject: Signal<Notification>,
    raw_subject: Signal<Vec<u8>>,
    rssi_subject: Signal<i32>,
    /// Responses that matched no in-flight request. Diagnostic only.
    unmatched_responses: AtomicU64,
}

/// Request/response service bound to one connected peripheral.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(peripheral: Arc<dyn Peripheral>, queue: CommandQueue) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                peripheral,
                queue,
                send: Mutex::new(SendState {
                    pending: VecDeque::new(),
                    in_flight: None,
                    next_id: 1,
                    next_generation: 1,
                    fragmenter: Fragmenter::new(DEFAULT_MAX_FRAGMENT),
                    assembler: Reassembler::new(),
                    closed: false,
                }),
                notify: Mutex::new(NotifyState {
                    assembler: Reassembler::new(),
                    observers: 0,
                    cached_attach: None,
                    cache_armed: true,
                }),
                raw: Mutex::new(RawState {
                    assembler: Reassembler::new(),
                    observers: 0,
                    next_seq: 0,
                }),
                rssi: Mutex::new(RssiState {
                    observers: 0,
                    task: None,
                }),
                notify_subject: Signal::create(),
                raw_subject: Signal::create(),
                rssi_subject: Signal::create(),
                unmatched_responses: AtomicU64::new(0),
            }),
        }
    }

    pub fn peripheral(&self) -> &Arc<dyn Peripheral> {
        &self.inner.peripheral
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.inner.queue
    }

    /// Adopt the payload size negotiated during the handshake.
    pub fn set_max_fragment_size(&self, size: usize) {
        let mut send = lock(&self.inner.send);
        send.fragmenter = Fragmenter::new(size);
        debug!(size, "max fragment size updated");
    }

    /// Responses that arrived without a matching in-flight request.
    pub fn unmatched_responses(&self) -> u64 {
        self.inner.unmatched_responses.load(Ordering::SeqCst)
    }

    /// Queue a request with the default retry and timeout policy.
    pub fn enqueue_default(&self, payload: RequestPayload) -> Signal<Response> {
        self.enqueue(
            payload,
            WriteMode::WithResponse,
            DEFAULT_REQUEST_RETRIES,
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    /// Queue a request. The returned signal delivers exactly one response and
    /// completes, or errors with timeout, retry exhaustion, or closure.
    /// Requests go out strictly in enqueue order, one at a time.
    pub fn enqueue(
        &self,
        payload: RequestPayload,
        write_mode: WriteMode,
        retries: u32,
        timeout: Duration,
    ) -> Signal<Response> {
        let sink = Signal::create();
        let start_now = {
            let mut send = lock(&self.inner.send);
            if send.closed {
                drop(send);
                sink.error(Error::TransportClosed);
                return sink;
            }
            send.pending.push_back(PendingRequest {
                payload,
                write_mode,
                retries,
                timeout,
                sink: sink.clone(),
            });
            send.in_flight.is_none()
        };
        if start_now {
            TransportInner::maybe_send_next(&self.inner);
        }
        sink
    }

    /// Notification stream. The first observer receives the cached attach
    /// notification, if one arrived before anybody listened.
    pub fn notifications(&self) -> Signal<Notification> {
        let inner = self.inner.clone();
        Signal::deferred(move |emitter| {
            let replay = {
                let mut notify = lock(&inner.notify);
                notify.observers += 1;
                notify.cache_armed = false;
                notify.cached_attach.take()
            };
            let forward = emitter.clone();
            let sub = inner.notify_subject.observe_with(
                move |notification| forward.next(notification),
                {
                    let emitter = emitter.clone();
                    move |error| emitter.error(error)
                },
                {
                    let emitter = emitter.clone();
                    move || emitter.complete()
                },
            );
            if let Some(notification) = replay {
                emitter.next(notification);
            }
            let inner = inner.clone();
            Subscription::new(move || {
                sub.unsubscribe();
                lock(&inner.notify).observers -= 1;
            })
        })
    }

    /// Reassembled raw-data packets. Fragments arriving while nobody observes
    /// are acked but dropped.
    pub fn raw_data(&self) -> Signal<Vec<u8>> {
        let inner = self.inner.clone();
        Signal::deferred(move |emitter| {
            lock(&inner.raw).observers += 1;
            let forward = emitter.clone();
            let sub = inner.raw_subject.observe_with(
                move |packet| forward.next(packet),
                {
                    let emitter = emitter.clone();
                    move |error| emitter.error(error)
                },
                move || emitter.complete(),
            );
            let inner = inner.clone();
            Subscription::new(move || {
                sub.unsubscribe();
                lock(&inner.raw).observers -= 1;
            })
        })
    }

    /// Send one packet on the raw-data channel, sequence-numbered and
    /// fragmented to fit the link. Fails when the payload does not fit the
    /// framing; the sequence number is not consumed in that case.
    pub fn send_raw_data(&self, payload: &[u8]) -> Result<(), Error> {
        let (fragments, seq) = {
            let send = lock(&self.inner.send);
            let mut raw = lock(&self.inner.raw);
            // The raw header costs two bytes on top of the inner framing.
            let inner_max = send.fragmenter.max_fragment_size().saturating_sub(2);
            let fragments = Fragmenter::new(inner_max).fragment(payload)?;
            let seq = raw.next_seq;
            raw.next_seq = raw.next_seq.wrapping_add(1);
            (fragments, seq)
        };
        for inner_fragment in fragments {
            let bytes = RawFragment {
                seq,
                ack: false,
                inner: inner_fragment,
            }
            .encode();
            let peripheral = self.inner.peripheral.clone();
            self.inner.queue.enqueue(Command::new(
                CommandKind::WriteCharacteristic,
                move || {
                    if peripheral.write_characteristic(
                        RAW_DATA_CHANNEL,
                        WriteMode::WithoutResponse,
                        &bytes,
                    ) {
                        Ok(())
                    } else {
                        Err(Error::WriteRejected)
                    }
                },
            ));
        }
        Ok(())
    }

    /// RSSI readings, polled once a second while at least one observer is
    /// attached. The first reading arrives after a one second delay.
    pub fn rssi_values(&self) -> Signal<i32> {
        let inner = self.inner.clone();
        Signal::deferred(move |emitter| {
            {
                let closed = lock(&inner.send).closed;
                let mut rssi = lock(&inner.rssi);
                rssi.observers += 1;
                if rssi.task.is_none() && !closed {
                    rssi.task = Some(TransportInner::spawn_rssi_poll(&inner));
                }
            }
            let forward = emitter.clone();
            let sub = inner.rssi_subject.observe_with(
                move |value| forward.next(value),
                {
                    let emitter = emitter.clone();
                    move |error| emitter.error(error)
                },
                move || emitter.complete(),
            );
            let inner = inner.clone();
            Subscription::new(move || {
                sub.unsubscribe();
                let mut rssi = lock(&inner.rssi);
                rssi.observers -= 1;
                if rssi.observers == 0 {
                    if let Some(task) = rssi.task.take() {
                        task.abort();
                    }
                }
            })
        })
    }

    /// Cancel RSSI polling regardless of observers. Polling resumes when a
    /// new observer attaches.
    pub fn stop_rssi(&self) {
        if let Some(task) = lock(&self.inner.rssi).task.take() {
            task.abort();
        }
    }

    /// Whether the polling timer is currently armed.
    pub fn is_rssi_polling(&self) -> bool {
        lock(&self.inner.rssi).task.is_some()
    }

    /// Queue a GATT service discovery.
    pub fn discover_services(&self) {
        let peripheral = self.inner.peripheral.clone();
        self.inner
            .queue
            .enqueue(Command::new(CommandKind::DiscoverServices, move || {
                if peripheral.discover_services() {
                    Ok(())
                } else {
                    Err(Error::WriteRejected)
                }
            }));
    }

    /// Queue notification enablement for all three channels.
    pub fn enable_channel_notifications(&self) {
        for channel in [COMMAND_CHANNEL, NOTIFY_CHANNEL, RAW_DATA_CHANNEL] {
            let peripheral = self.inner.peripheral.clone();
            self.inner
                .queue
                .enqueue(Command::new(CommandKind::WriteDescriptor, move || {
                    if peripheral.enable_notification(channel, true) {
                        Ok(())
                    } else {
                        Err(Error::WriteRejected)
                    }
                }));
        }
    }

    pub fn request_connection_priority(&self, priority: ConnectionPriority) {
        if !self.inner.peripheral.request_connection_priority(priority) {
            warn!(?priority, "connection priority request rejected");
        }
    }

    /// Route one hardware event into the transport.
    pub fn handle_event(&self, event: &ConnectionState) {
        match event {
            ConnectionState::CharacteristicUpdated(_, update) => {
                self.inner.on_characteristic_update(update)
            }
            ConnectionState::ValueWritten(_, _) => {
                // Characteristic and descriptor writes both complete here;
                // ask the queue which one is outstanding.
                let kind = match self.inner.queue.in_flight() {
                    Some(
                        kind @ (CommandKind::WriteCharacteristic | CommandKind::WriteDescriptor),
                    ) => kind,
                    _ => CommandKind::WriteCharacteristic,
                };
                self.inner.queue.completed_command(kind);
            }
            ConnectionState::ServicesDiscovered(_, _) => {
                self.inner.queue.completed_command(CommandKind::DiscoverServices);
            }
            ConnectionState::RssiUpdated(_, value) => {
                self.inner
                    .queue
                    .completed_command(CommandKind::ReadCharacteristic);
                self.inner.rssi_subject.next(*value);
            }
            ConnectionState::Disconnected(_) => self.discard(),
            ConnectionState::Connected(_) | ConnectionState::FailedToConnect(_, _) => {}
        }
    }

    /// Tear down: fail everything pending, stop polling, end the streams.
    /// Idempotent.
    pub fn discard(&self) {
        let (pending, in_flight) = {
            let mut send = lock(&self.inner.send);
            if send.closed {
                return;
            }
            send.closed = true;
            (std::mem::take(&mut send.pending), send.in_flight.take())
        };
        if let Some(flight) = in_flight {
            if let Some(task) = flight.timeout_task {
                task.abort();
            }
            flight.sink.error(Error::TransportClosed);
        }
        for request in pending {
            request.sink.error(Error::TransportClosed);
        }
        self.stop_rssi();
        self.inner.notify_subject.complete();
        self.inner.raw_subject.complete();
        self.inner.rssi_subject.complete();
        debug!(address = %self.inner.peripheral.address(), "transport discarded");
    }
}

impl TransportInner {
    /// Promote the next pending request if nothing is in flight.
    fn maybe_send_next(inner: &Arc<Self>) {
        let (generation, timeout) = {
            let mut send = lock(&inner.send);
            if send.closed || send.in_flight.is_some() {
                return;
            }
            let Some(request) = send.pending.pop_front() else {
                return;
            };
            let id = send.next_id;
            send.next_id = send.next_id.wrapping_add(1).max(1);
            let generation = send.next_generation;
            send.next_generation += 1;
            let timeout = request.timeout;
            send.in_flight = Some(InFlight {
                id,
                payload: request.payload,
                write_mode: request.write_mode,
                retries_left: request.retries,
                attempt: 0,
                timeout,
                timeout_task: None,
                generation,
                sink: request.sink,
            });
            (generation, timeout)
        };

        let task = tokio::spawn({
            let inner = inner.clone();
            async move {
                tokio::time::sleep(timeout).await;
                Self::on_timeout(&inner, generation);
            }
        });
        {
            let mut send = lock(&inner.send);
            match &mut send.in_flight {
                Some(flight) if flight.generation == generation => {
                    flight.timeout_task = Some(task)
                }
                // Resolved synchronously before we got the lock back.
                _ => task.abort(),
            }
        }

        Self::send_attempt(inner, generation);
    }

    /// Encode and enqueue every fragment of the current attempt.
    fn send_attempt(inner: &Arc<Self>, generation: u64) {
        let plan = {
            let send = lock(&inner.send);
            match &send.in_flight {
                Some(flight) if flight.generation == generation => {
                    let request = Request {
                        id: flight.id,
                        payload: flight.payload.clone(),
                    };
                    encode_request(&request)
                        .and_then(|bytes| send.fragmenter.fragment(&bytes))
                        .map(|fragments| (fragments, flight.write_mode, flight.attempt))
                }
                _ => return,
            }
        };

        let (fragments, write_mode, attempt) = match plan {
            Ok(plan) => plan,
            Err(error) => {
                // Unencodable or oversized request: fail it without touching
                // the link.
                warn!(%error, "request rejected before send");
                Self::fail_in_flight(inner, generation, error);
                return;
            }
        };

        trace!(generation, attempt, fragments = fragments.len(), "sending request");
        for fragment in fragments {
            let inner = inner.clone();
            inner.queue.clone().enqueue(Command::new(
                CommandKind::WriteCharacteristic,
                move || {
                    let current = lock(&inner.send)
                        .in_flight
                        .as_ref()
                        .map(|flight| (flight.generation, flight.attempt));
                    if current != Some((generation, attempt)) {
                        return Err(Error::SupersededWrite);
                    }
                    if inner.peripheral.write_characteristic(
                        COMMAND_CHANNEL,
                        write_mode,
                        &fragment,
                    ) {
                        Ok(())
                    } else {
                        Self::on_write_failure(&inner, generation);
                        Err(Error::WriteRejected)
                    }
                },
            ));
        }
    }

    /// A fragment write was rejected: resend while retries remain, otherwise
    /// fail the request and advance.
    fn on_write_failure(inner: &Arc<Self>, generation: u64) {
        enum Outcome {
            Retry,
            Fail(u32),
            Stale,
        }
        let outcome = {
            let mut send = lock(&inner.send);
            match &mut send.in_flight {
                Some(flight) if flight.generation == generation => {
                    if flight.retries_left > 0 {
                        flight.retries_left -= 1;
                        flight.attempt += 1;
                        Outcome::Retry
                    } else {
                        Outcome::Fail(flight.attempt + 1)
                    }
                }
                _ => Outcome::Stale,
            }
        };
        match outcome {
            Outcome::Retry => {
                debug!(generation, "write rejected, resending request");
                Self::send_attempt(inner, generation);
            }
            Outcome::Fail(attempts) => {
                let address = inner.peripheral.address();
                warn!(%address, attempts, "write retries exhausted");
                Self::fail_in_flight(
                    inner,
                    generation,
                    Error::RetriesExhausted { address, attempts },
                );
            }
            Outcome::Stale => {}
        }
    }

    fn on_timeout(inner: &Arc<Self>, generation: u64) {
        debug!(generation, "request timed out");
        let timeout = lock(&inner.send)
            .in_flight
            .as_ref()
            .filter(|flight| flight.generation == generation)
            .map(|flight| flight.timeout);
        if let Some(timeout) = timeout {
            Self::fail_in_flight(inner, generation, Error::Timeout(timeout));
        }
    }

    /// Error the in-flight sink (if the generation still matches) and move on.
    fn fail_in_flight(inner: &Arc<Self>, generation: u64, error: Error) {
        let flight = {
            let mut send = lock(&inner.send);
            let matches = send
                .in_flight
                .as_ref()
                .is_some_and(|flight| flight.generation == generation);
            if matches {
                send.in_flight.take()
            } else {
                None
            }
        };
        if let Some(flight) = flight {
            if let Some(task) = flight.timeout_task {
                task.abort();
            }
            flight.sink.error(error);
            Self::maybe_send_next(inner);
        }
    }

    fn on_characteristic_update(self: &Arc<Self>, update: &CharacteristicUpdate) {
        match update.characteristic {
            COMMAND_CHANNEL => self.on_response_bytes(&update.value),
            NOTIFY_CHANNEL => self.on_notify_bytes(&update.value),
            RAW_DATA_CHANNEL => self.on_raw_bytes(&update.value),
            other => debug!(characteristic = other.0, "update on unknown characteristic"),
        }
    }

    fn on_response_bytes(self: &Arc<Self>, bytes: &[u8]) {
        let packet = {
            let mut send = lock(&self.send);
            match send.assembler.push(bytes) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!(%error, "response fragment rejected");
                    return;
                }
            }
        };
        let Some(packet) = packet else { return };

        let response = match decode_response(&packet) {
            Ok(response) => response,
            Err(error) => {
                // Malformed packet: not a match, the timeout will fire.
                warn!(%error, "response packet failed to decode");
                return;
            }
        };

        let flight = {
            let mut send = lock(&self.send);
            let expected = send.in_flight.as_ref().map(|flight| flight.id);
            if expected == Some(response.id) {
                send.in_flight.take()
            } else {
                match expected {
                    Some(expected) => debug!(
                        expected,
                        got = response.id,
                        "response id mismatch, dropped"
                    ),
                    None => debug!(id = response.id, "response with nothing in flight"),
                }
                self.unmatched_responses.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        if let Some(flight) = flight {
            if let Some(task) = flight.timeout_task {
                task.abort();
            }
            flight.sink.next(response);
            flight.sink.complete();
            Self::maybe_send_next(self);
        }
    }

    fn on_notify_bytes(self: &Arc<Self>, bytes: &[u8]) {
        let packet = {
            let mut notify = lock(&self.notify);
            match notify.assembler.push(bytes) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!(%error, "notification fragment rejected");
                    return;
                }
            }
        };
        let Some(packet) = packet else { return };

        let notification = match decode_notification(&packet) {
            Ok(notification) => notification,
            Err(error) => {
                warn!(%error, "notification packet failed to decode");
                return;
            }
        };

        let deliver = {
            let mut notify = lock(&self.notify);
            if notify.observers == 0
                && notify.cache_armed
                && notify.cached_attach.is_none()
                && notification.is_attach()
            {
                debug!("attach notification cached for the first observer");
                notify.cached_attach = Some(notification.clone());
                false
            } else {
                true
            }
        };
        if deliver {
            self.notify_subject.next(notification);
        }
    }

    fn on_raw_bytes(self: &Arc<Self>, bytes: &[u8]) {
        let fragment = match RawFragment::decode(bytes) {
            Ok(fragment) => fragment,
            Err(error) => {
                warn!(%error, "raw fragment rejected");
                return;
            }
        };
        if fragment.ack {
            trace!(seq = fragment.seq, "raw ack received");
            return;
        }

        // Ack first, unconditionally; delivery depends on observers.
        let ack = RawFragment::ack_for(fragment.seq).encode();
        let peripheral = self.peripheral.clone();
        self.queue.enqueue(Command::new(
            CommandKind::WriteCharacteristic,
            move || {
                if peripheral.write_characteristic(
                    RAW_DATA_CHANNEL,
                    WriteMode::WithoutResponse,
                    &ack,
                ) {
                    Ok(())
                } else {
                    Err(Error::WriteRejected)
                }
            },
        ));

        let packet = {
            let mut raw = lock(&self.raw);
            if raw.observers == 0 {
                // Nobody listening: drop, and forget any partial packet.
                raw.assembler = Reassembler::new();
                return;
            }
            match raw.assembler.push(&fragment.inner) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!(%error, "raw inner fragment rejected");
                    return;
                }
            }
        };
        if let Some(packet) = packet {
            self.raw_subject.next(packet);
        }
    }

    fn spawn_rssi_poll(inner: &Arc<Self>) -> JoinHandle<()> {
        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RSSI_POLL_DELAY).await;
            loop {
                let peripheral = inner.peripheral.clone();
                inner
                    .queue
                    .enqueue(Command::new(CommandKind::ReadCharacteristic, move || {
                        if peripheral.request_rssi() {
                            Ok(())
                        } else {
                            Err(Error::WriteRejected)
                        }
                    }));
                tokio::time::sleep(RSSI_POLL_PERIOD).await;
            }
        })
    }
}
