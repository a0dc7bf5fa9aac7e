//! Push-based event stream primitive.
//!
//! Every component in this crate communicates through [`Signal`]: a typed,
//! possibly-infinite sequence of values with two terminal outcomes
//! (completion and error). Delivery is synchronous on whatever thread pushed
//! the value; [`Signal::observe_on`] is the only operator that hops execution
//! context.
//!
//! A `Signal` is both a subject (values can be pushed into it with
//! [`Signal::next`]) and, when built with [`Signal::deferred`], a lazy source
//! whose setup action runs once per attached observer and whose cleanup runs
//! exactly once when that observer unsubscribes.

mod ops;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Error;

/// Lock a mutex, ignoring poisoning. All shared state in this crate follows a
/// single-writer discipline; a panicked holder leaves plain data behind.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiver half of a [`Signal`] subscription.
pub trait Observer<T>: Send {
    /// A value was pushed into the stream.
    fn on_next(&mut self, value: T);

    /// The stream terminated with an error. No further events follow.
    fn on_error(&mut self, error: Error) {
        tracing::debug!(%error, "unobserved stream error");
    }

    /// The stream completed normally. No further events follow.
    fn on_complete(&mut self) {}
}

struct ClosureObserver<N, E, C> {
    next: N,
    error: E,
    complete: C,
}

impl<T, N, E, C> Observer<T> for ClosureObserver<N, E, C>
where
    N: FnMut(T) + Send,
    E: FnMut(Error) + Send,
    C: FnMut() + Send,
{
    fn on_next(&mut self, value: T) {
        (self.next)(value);
    }

    fn on_error(&mut self, error: Error) {
        (self.error)(error);
    }

    fn on_complete(&mut self) {
        (self.complete)();
    }
}

#[derive(Clone)]
enum Terminal {
    Completed,
    Errored(Error),
}

enum SlotEvent<T> {
    Next(T),
    Error(Error),
    Complete,
}

/// Serializes calls into one observer without holding a lock across the
/// callback. An event arriving while the observer is already executing, on
/// this thread (a handler pushing back into its own stream) or another, is
/// queued and drained by the active call after the observer returns.
struct ObserverCell<T> {
    state: Mutex<ObserverCellState<T>>,
}

struct ObserverCellState<T> {
    /// Taken out for the duration of a delivery; `None` means one is running.
    observer: Option<Box<dyn Observer<T>>>,
    backlog: VecDeque<SlotEvent<T>>,
}

impl<T> ObserverCell<T> {
    fn new(observer: Box<dyn Observer<T>>) -> Self {
        Self {
            state: Mutex::new(ObserverCellState {
                observer: Some(observer),
                backlog: VecDeque::new(),
            }),
        }
    }

    fn deliver(&self, event: SlotEvent<T>) {
        let mut observer = {
            let mut state = lock(&self.state);
            match state.observer.take() {
                Some(observer) => observer,
                None => {
                    state.backlog.push_back(event);
                    return;
                }
            }
        };
        let mut event = event;
        loop {
            match event {
                SlotEvent::Next(value) => observer.on_next(value),
                SlotEvent::Error(error) => observer.on_error(error),
                SlotEvent::Complete => observer.on_complete(),
            }
            let mut state = lock(&self.state);
            match state.backlog.pop_front() {
                Some(queued) => {
                    drop(state);
                    event = queued;
                }
                None => {
                    state.observer = Some(observer);
                    return;
                }
            }
        }
    }
}

/// One attached observer. `gone` is set when the observer unsubscribes or
/// receives a terminal event; dispatch skips and eventually prunes such slots.
struct Slot<T> {
    id: u64,
    gone: Arc<AtomicBool>,
    cell: Arc<ObserverCell<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            gone: self.gone.clone(),
            cell: self.cell.clone(),
        }
    }
}

struct SignalState<T> {
    slots: Vec<Slot<T>>,
    terminal: Option<Terminal>,
    next_id: u64,
}

type AttachFn<T> = dyn Fn(Emitter<T>) -> Subscription + Send + Sync;

/// A push-based observable stream. Cloning yields another handle onto the
/// same underlying stream.
pub struct Signal<T> {
    state: Arc<Mutex<SignalState<T>>>,
    on_attach: Option<Arc<AttachFn<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            on_attach: self.on_attach.clone(),
        }
    }
}

/// Pushes events to exactly one observer of a deferred signal. Handed to the
/// setup callback so that derived streams deliver per-subscription rather
/// than fanning out through the shared subject.
pub struct Emitter<T> {
    slot: Slot<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Push a value to this observer unless it has already terminated or
    /// unsubscribed.
    pub fn next(&self, value: T) {
        if !self.slot.gone.load(Ordering::SeqCst) {
            self.slot.cell.deliver(SlotEvent::Next(value));
        }
    }

    /// Terminate this observer with an error. Later pushes are no-ops.
    pub fn error(&self, error: Error) {
        if !self.slot.gone.swap(true, Ordering::SeqCst) {
            self.slot.cell.deliver(SlotEvent::Error(error));
        }
    }

    /// Complete this observer. Later pushes are no-ops.
    pub fn complete(&self) {
        if !self.slot.gone.swap(true, Ordering::SeqCst) {
            self.slot.cell.deliver(SlotEvent::Complete);
        }
    }

    /// Whether a terminal event was already delivered (or the observer left).
    pub fn is_done(&self) -> bool {
        self.slot.gone.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    /// A plain subject: no setup action, values arrive via [`Signal::next`].
    pub fn create() -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalState {
                slots: Vec::new(),
                terminal: None,
                next_id: 0,
            })),
            on_attach: None,
        }
    }

    /// A signal whose setup callback runs once per attaching observer. The
    /// returned [`Subscription`] is cancelled when that observer unsubscribes.
    pub fn deferred<F>(on_attach: F) -> Self
    where
        F: Fn(Emitter<T>) -> Subscription + Send + Sync + 'static,
    {
        let mut signal = Self::create();
        signal.on_attach = Some(Arc::new(on_attach));
        signal
    }

    /// Emits one value, then completes.
    pub fn just(value: T) -> Self {
        // The setup closure must be `Sync`; the mutex keeps `T` unconstrained.
        let value = Mutex::new(value);
        Self::deferred(move |emitter| {
            let value = lock(&value).clone();
            emitter.next(value);
            emitter.complete();
            Subscription::resolved()
        })
    }

    /// Completes immediately without emitting.
    pub fn empty() -> Self {
        Self::deferred(|emitter| {
            emitter.complete();
            Subscription::resolved()
        })
    }

    /// Fails immediately with the given error.
    pub fn failed(error: Error) -> Self {
        Self::deferred(move |emitter| {
            emitter.error(error.clone());
            Subscription::resolved()
        })
    }

    /// Attach an observer. If the stream has already terminated, the terminal
    /// event is replayed immediately and the returned subscription is inert.
    pub fn observe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        let cell = Arc::new(ObserverCell::new(Box::new(observer)));
        let gone = Arc::new(AtomicBool::new(false));
        let id;
        {
            let mut state = lock(&self.state);
            if let Some(terminal) = state.terminal.clone() {
                drop(state);
                match terminal {
                    Terminal::Completed => cell.deliver(SlotEvent::Complete),
                    Terminal::Errored(error) => cell.deliver(SlotEvent::Error(error)),
                }
                return Subscription::resolved();
            }
            id = state.next_id;
            state.next_id += 1;
            state.slots.push(Slot {
                id,
                gone: gone.clone(),
                cell: cell.clone(),
            });
        }

        let setup = self.on_attach.as_ref().map(|attach| {
            attach(Emitter {
                slot: Slot {
                    id,
                    gone: gone.clone(),
                    cell: cell.clone(),
                },
            })
        });

        let state = self.state.clone();
        Subscription::new(move || {
            gone.store(true, Ordering::SeqCst);
            lock(&state).slots.retain(|slot| slot.id != id);
            if let Some(setup) = &setup {
                setup.unsubscribe();
            }
        })
    }

    /// Attach closures for all three event kinds.
    pub fn observe_with<N, E, C>(&self, next: N, error: E, complete: C) -> Subscription
    where
        N: FnMut(T) + Send + 'static,
        E: FnMut(Error) + Send + 'static,
        C: FnMut() + Send + 'static,
    {
        self.observe(ClosureObserver {
            next,
            error,
            complete,
        })
    }

    /// Attach a value-only observer; terminal events are logged and dropped.
    pub fn observe_next<N>(&self, next: N) -> Subscription
    where
        N: FnMut(T) + Send + 'static,
    {
        self.observe_with(
            next,
            |error| tracing::debug!(%error, "unobserved stream error"),
            || {},
        )
    }

    /// Push a value to every current observer, synchronously on this thread.
    /// A no-op once the stream has terminated.
    pub fn next(&self, value: T) {
        let slots = {
            let mut state = lock(&self.state);
            if state.terminal.is_some() {
                return;
            }
            state.slots.retain(|slot| !slot.gone.load(Ordering::SeqCst));
            state.slots.clone()
        };
        for slot in slots {
            if !slot.gone.load(Ordering::SeqCst) {
                slot.cell.deliver(SlotEvent::Next(value.clone()));
            }
        }
    }

    /// Terminate the stream with an error. Drains all observers; the terminal
    /// event is replayed to late subscribers.
    pub fn error(&self, error: Error) {
        self.terminate(Terminal::Errored(error));
    }

    /// Complete the stream. Drains all observers; completion is replayed to
    /// late subscribers.
    pub fn complete(&self) {
        self.terminate(Terminal::Completed);
    }

    fn terminate(&self, terminal: Terminal) {
        let slots = {
            let mut state = lock(&self.state);
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.slots)
        };
        for slot in slots {
            if !slot.gone.swap(true, Ordering::SeqCst) {
                match &terminal {
                    Terminal::Completed => slot.cell.deliver(SlotEvent::Complete),
                    Terminal::Errored(error) => {
                        slot.cell.deliver(SlotEvent::Error(error.clone()))
                    }
                }
            }
        }
    }

    /// Number of currently attached observers. Diagnostic only.
    pub fn observer_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.slots.retain(|slot| !slot.gone.load(Ordering::SeqCst));
        state.slots.len()
    }

    /// Whether the stream has delivered a terminal event.
    pub fn is_terminated(&self) -> bool {
        lock(&self.state).terminal.is_some()
    }
}

struct SubscriptionInner {
    cancelled: AtomicBool,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Idempotent cancellation handle for one attached observer.
///
/// Dropping a `Subscription` does *not* cancel it; collect handles in a
/// [`SubscriptionBag`] for scoped teardown.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// A live subscription running `cleanup` exactly once on unsubscribe.
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(SubscriptionInner {
                cancelled: AtomicBool::new(false),
                cleanup: Mutex::new(Some(Box::new(cleanup))),
            }),
        }
    }

    /// An already-spent subscription; unsubscribing is a no-op.
    pub fn resolved() -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                cancelled: AtomicBool::new(true),
                cleanup: Mutex::new(None),
            }),
        }
    }

    /// Cancels several subscriptions as one.
    pub fn composite<I>(subscriptions: I) -> Self
    where
        I: IntoIterator<Item = Subscription>,
    {
        let subscriptions: Vec<Subscription> = subscriptions.into_iter().collect();
        Self::new(move || {
            for subscription in &subscriptions {
                subscription.unsubscribe();
            }
        })
    }

    /// Cancel this observer. Safe to call repeatedly; cleanup runs once.
    pub fn unsubscribe(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            if let Some(cleanup) = lock(&self.inner.cleanup).take() {
                cleanup();
            }
        }
    }

    /// Whether `unsubscribe` has been called (or the subscription was inert).
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

/// Connection-scoped collection of subscriptions, released on drop.
///
/// Replaces manual lists of cancellation handles: adding every subscription
/// tied to a connection to its bag guarantees none outlive the connection.
#[derive(Default)]
pub struct SubscriptionBag {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription for release when the bag is cleared or dropped.
    pub fn add(&self, subscription: Subscription) {
        lock(&self.subscriptions).push(subscription);
    }

    /// Unsubscribe and forget everything currently in the bag.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *lock(&self.subscriptions));
        for subscription in drained {
            subscription.unsubscribe();
        }
    }

    /// Number of tracked subscriptions. Diagnostic only.
    pub fn len(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.subscriptions).is_empty()
    }
}

impl Drop for SubscriptionBag {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_all_observers() {
        let signal: Signal<u32> = Signal::create();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let a2 = a.clone();
        let b2 = b.clone();
        let _sa = signal.observe_next(move |v| lock(&a2).push(v));
        let _sb = signal.observe_next(move |v| lock(&b2).push(v));

        signal.next(1);
        signal.next(2);

        assert_eq!(*lock(&a), vec![1, 2]);
        assert_eq!(*lock(&b), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_removes_observer_and_is_idempotent() {
        let signal: Signal<u32> = Signal::create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = signal.observe_next(move |v| lock(&seen2).push(v));

        signal.next(1);
        sub.unsubscribe();
        signal.next(2);
        sub.unsubscribe();
        signal.next(3);

        assert_eq!(*lock(&seen), vec![1]);
        assert_eq!(signal.observer_count(), 0);
    }

    #[test]
    fn unsubscribe_suppresses_only_that_observer() {
        let signal: Signal<u32> = Signal::create();
        let kept = Arc::new(Mutex::new(Vec::new()));
        let kept2 = kept.clone();
        let sub = signal.observe_next(|_| {});
        let _keep = signal.observe_next(move |v| lock(&kept2).push(v));

        sub.unsubscribe();
        signal.next(7);

        assert_eq!(*lock(&kept), vec![7]);
    }

    #[test]
    fn terminal_drains_observers_and_replays_to_late_subscribers() {
        let signal: Signal<u32> = Signal::create();
        let completions = Arc::new(AtomicUsize::new(0));
        let completions2 = completions.clone();
        let _sub = signal.observe_with(|_| {}, |_| {}, move || {
            completions2.fetch_add(1, Ordering::SeqCst);
        });

        signal.complete();
        // Pushing after termination is a no-op.
        signal.next(1);
        assert_eq!(signal.observer_count(), 0);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // Late subscriber sees the terminal event immediately.
        let completions3 = completions.clone();
        let late = signal.observe_with(|_: u32| {}, |_| {}, move || {
            completions3.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(completions.load(Ordering::SeqCst), 2);
        assert!(late.is_cancelled());
    }

    #[test]
    fn error_reaches_observer_once() {
        let signal: Signal<u32> = Signal::create();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        let _sub = signal.observe_with(|_| {}, move |e| lock(&errors2).push(e), || {});

        signal.error(Error::BluetoothUnavailable);
        signal.error(Error::BluetoothUnavailable);

        assert_eq!(*lock(&errors), vec![Error::BluetoothUnavailable]);
    }

    #[test]
    fn deferred_setup_runs_per_observer_and_cleanup_once() {
        let setups = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let setups2 = setups.clone();
        let cleanups2 = cleanups.clone();
        let signal: Signal<u32> = Signal::deferred(move |emitter| {
            setups2.fetch_add(1, Ordering::SeqCst);
            emitter.next(42);
            let cleanups = cleanups2.clone();
            Subscription::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            })
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let first = signal.observe_next(move |v| lock(&seen2).push(v));
        let second = signal.observe_next(|_| {});

        assert_eq!(setups.load(Ordering::SeqCst), 2);
        assert_eq!(*lock(&seen), vec![42]);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        second.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn just_and_empty_and_failed() {
        let values = Arc::new(Mutex::new(Vec::new()));
        let values2 = values.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let _sub = Signal::just(5u32).observe_with(
            move |v| lock(&values2).push(v),
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );
        assert_eq!(*lock(&values), vec![5]);
        assert!(done.load(Ordering::SeqCst));

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let _sub = Signal::<u32>::empty().observe_with(
            |_| {},
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );
        assert!(done.load(Ordering::SeqCst));

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        let _sub = Signal::<u32>::failed(Error::FragmentSequence).observe_with(
            |_| {},
            move |e| lock(&errors2).push(e),
            || {},
        );
        assert_eq!(*lock(&errors), vec![Error::FragmentSequence]);
    }

    #[test]
    fn reentrant_push_from_a_callback_is_delivered_after_it_returns() {
        let signal: Signal<u32> = Signal::create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let feedback = signal.clone();
        let _sub = signal.observe_next(move |value| {
            lock(&seen2).push(value);
            // A handler pushing back into its own stream must not block or
            // deliver out of order.
            if value == 1 {
                feedback.next(2);
            }
        });

        signal.next(1);

        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[test]
    fn reentrant_completion_from_a_callback() {
        let signal: Signal<u32> = Signal::create();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let feedback = signal.clone();
        let _sub = signal.observe_with(
            move |value| {
                lock(&seen2).push(value);
                feedback.complete();
            },
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );

        signal.next(9);

        assert_eq!(*lock(&seen), vec![9]);
        assert!(done.load(Ordering::SeqCst));
        assert!(signal.is_terminated());
    }

    #[test]
    fn just_accepts_send_only_values() {
        use std::cell::Cell;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = Signal::just(Cell::new(7u32))
            .observe_next(move |cell: Cell<u32>| lock(&seen2).push(cell.get()));
        assert_eq!(*lock(&seen), vec![7]);
    }

    #[test]
    fn bag_releases_all_on_drop_exactly_once() {
        let signal: Signal<u32> = Signal::create();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let bag = SubscriptionBag::new();
        for _ in 0..3 {
            let cleanups = cleanups.clone();
            let sub = signal.observe_next(|_| {});
            bag.add(Subscription::composite(vec![
                sub,
                Subscription::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }),
            ]));
        }
        assert_eq!(signal.observer_count(), 3);
        drop(bag);
        assert_eq!(signal.observer_count(), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
    }
}
