//! Operators deriving new signals from a source.
//!
//! Each operator subscribes to its source lazily, once per observer of the
//! derived signal, and delivers through a per-observer [`Emitter`] so that
//! independent observers never see each other's traffic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{lock, Emitter, Signal, Subscription};
use crate::error::Error;

enum Relayed<T> {
    Next(tokio::time::Instant, T),
    Error(Error),
    Complete(tokio::time::Instant),
}

struct FlatMapState<U> {
    pending: VecDeque<Signal<U>>,
    inner_active: bool,
    inner_gen: u64,
    source_done: bool,
    inner_sub: Option<Subscription>,
}

struct FlatMapCtx<U> {
    emitter: Emitter<U>,
    state: Mutex<FlatMapState<U>>,
}

fn flat_map_drive<U: Clone + Send + 'static>(ctx: &Arc<FlatMapCtx<U>>, inner: Signal<U>) {
    let generation = {
        let mut state = lock(&ctx.state);
        state.inner_gen += 1;
        state.inner_gen
    };
    let on_next = {
        let ctx = ctx.clone();
        move |value| ctx.emitter.next(value)
    };
    let on_error = {
        let ctx = ctx.clone();
        move |error| ctx.emitter.error(error)
    };
    let on_complete = {
        let ctx = ctx.clone();
        move || {
            let (start, finish) = {
                let mut state = lock(&ctx.state);
                match state.pending.pop_front() {
                    Some(next_signal) => (Some(next_signal), false),
                    None => {
                        state.inner_active = false;
                        state.inner_sub = None;
                        (None, state.source_done)
                    }
                }
            };
            if let Some(next_signal) = start {
                flat_map_drive(&ctx, next_signal);
            } else if finish {
                ctx.emitter.complete();
            }
        }
    };
    let subscription = inner.observe_with(on_next, on_error, on_complete);
    let mut state = lock(&ctx.state);
    // A synchronously-completing inner may already have advanced to the next
    // signal; only record the handle if this inner is still the current one.
    if state.inner_gen == generation && state.inner_active {
        state.inner_sub = Some(subscription);
    }
}

struct MulticastCore<T> {
    subject: Signal<T>,
    upstream: Option<Subscription>,
    starting: bool,
    /// Upstream terminated; never resubscribe, never replay the terminal.
    terminated: bool,
    observers: usize,
    last: Option<T>,
}

impl<T: Clone + Send + 'static> Signal<T> {
    /// Transform each value. The derived stream completes and errors with the
    /// source.
    pub fn map<U, F>(&self, transform: F) -> Signal<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let source = self.clone();
        let transform = Arc::new(Mutex::new(transform));
        Signal::deferred(move |emitter| {
            let transform = transform.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            source.observe_with(
                move |value| {
                    let mapped = {
                        let mut f = lock(&transform);
                        (*f)(value)
                    };
                    emitter.next(mapped);
                },
                move |error| err.error(error),
                move || done.complete(),
            )
        })
    }

    /// Transform each value fallibly; an `Err` fails the derived stream.
    pub fn try_map<U, F>(&self, transform: F) -> Signal<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> Result<U, Error> + Send + 'static,
    {
        let source = self.clone();
        let transform = Arc::new(Mutex::new(transform));
        Signal::deferred(move |emitter| {
            let transform = transform.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            source.observe_with(
                move |value| {
                    let mapped = {
                        let mut f = lock(&transform);
                        (*f)(value)
                    };
                    match mapped {
                        Ok(mapped) => emitter.next(mapped),
                        Err(error) => emitter.error(error),
                    }
                },
                move |error| err.error(error),
                move || done.complete(),
            )
        })
    }

    /// Keep only values matching the predicate.
    pub fn filter<F>(&self, predicate: F) -> Signal<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let source = self.clone();
        let predicate = Arc::new(Mutex::new(predicate));
        Signal::deferred(move |emitter| {
            let predicate = predicate.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            source.observe_with(
                move |value| {
                    let keep = {
                        let mut p = lock(&predicate);
                        (*p)(&value)
                    };
                    if keep {
                        emitter.next(value);
                    }
                },
                move |error| err.error(error),
                move || done.complete(),
            )
        })
    }

    /// Running accumulation; emits the accumulator after each source value.
    pub fn scan<U, F>(&self, initial: U, step: F) -> Signal<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(&U, T) -> U + Send + 'static,
    {
        let source = self.clone();
        let step = Arc::new(Mutex::new(step));
        // The setup closure must be `Sync`; the mutex keeps `U` unconstrained.
        let initial = Mutex::new(initial);
        Signal::deferred(move |emitter| {
            let step = step.clone();
            let acc = Arc::new(Mutex::new(lock(&initial).clone()));
            let err = emitter.clone();
            let done = emitter.clone();
            source.observe_with(
                move |value| {
                    let next = {
                        let mut f = lock(&step);
                        let acc = lock(&acc);
                        let next = (*f)(&acc, value);
                        drop(acc);
                        next
                    };
                    *lock(&acc) = next.clone();
                    emitter.next(next);
                },
                move |error| err.error(error),
                move || done.complete(),
            )
        })
    }

    /// Suppress a value equal to the immediately preceding one. The first
    /// value is always delivered.
    pub fn distinct_until_changed(&self) -> Signal<T>
    where
        T: PartialEq,
    {
        let source = self.clone();
        Signal::deferred(move |emitter| {
            let last: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
            let err = emitter.clone();
            let done = emitter.clone();
            source.observe_with(
                move |value| {
                    let changed = {
                        let mut last = lock(&last);
                        let changed = last.as_ref() != Some(&value);
                        if changed {
                            *last = Some(value.clone());
                        }
                        changed
                    };
                    if changed {
                        emitter.next(value);
                    }
                },
                move |error| err.error(error),
                move || done.complete(),
            )
        })
    }

    /// Deliver at most `count` values, then complete and release the source.
    pub fn take(&self, count: usize) -> Signal<T> {
        let source = self.clone();
        Signal::deferred(move |emitter| {
            if count == 0 {
                emitter.complete();
                return Subscription::resolved();
            }
            let remaining = Arc::new(Mutex::new(count));
            let source_sub: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
            let finished = Arc::new(AtomicBool::new(false));
            let err = emitter.clone();
            let done = emitter.clone();
            let finished2 = finished.clone();
            let source_sub2 = source_sub.clone();
            let subscription = source.observe_with(
                move |value| {
                    let emit_last = {
                        let mut remaining = lock(&remaining);
                        if *remaining == 0 {
                            return;
                        }
                        *remaining -= 1;
                        *remaining == 0
                    };
                    emitter.next(value);
                    if emit_last {
                        emitter.complete();
                        finished2.store(true, Ordering::SeqCst);
                        if let Some(sub) = lock(&source_sub2).take() {
                            sub.unsubscribe();
                        }
                    }
                },
                move |error| err.error(error),
                move || done.complete(),
            );
            if finished.load(Ordering::SeqCst) {
                subscription.unsubscribe();
            } else {
                *lock(&source_sub) = Some(subscription.clone());
            }
            subscription
        })
    }

    /// The first value only.
    pub fn first(&self) -> Signal<T> {
        self.take(1)
    }

    /// Skip the first `count` values.
    pub fn drop_first(&self, count: usize) -> Signal<T> {
        let source = self.clone();
        Signal::deferred(move |emitter| {
            let skipped = Arc::new(Mutex::new(0usize));
            let err = emitter.clone();
            let done = emitter.clone();
            source.observe_with(
                move |value| {
                    let deliver = {
                        let mut skipped = lock(&skipped);
                        if *skipped < count {
                            *skipped += 1;
                            false
                        } else {
                            true
                        }
                    };
                    if deliver {
                        emitter.next(value);
                    }
                },
                move |error| err.error(error),
                move || done.complete(),
            )
        })
    }

    /// Interleave two streams; completes when both complete, errors with the
    /// first error.
    pub fn merge(&self, other: &Signal<T>) -> Signal<T> {
        let left = self.clone();
        let right = other.clone();
        Signal::deferred(move |emitter| {
            let open = Arc::new(AtomicUsize::new(2));
            let mut subscriptions = Vec::with_capacity(2);
            for source in [&left, &right] {
                let value_emitter = emitter.clone();
                let err = emitter.clone();
                let done = emitter.clone();
                let open = open.clone();
                subscriptions.push(source.observe_with(
                    move |value| value_emitter.next(value),
                    move |error| err.error(error),
                    move || {
                        if open.fetch_sub(1, Ordering::SeqCst) == 1 {
                            done.complete();
                        }
                    },
                ));
            }
            Subscription::composite(subscriptions)
        })
    }

    /// For each source value, subscribe to the derived inner signal,
    /// preserving source order: while an inner signal is live, later source
    /// values queue behind it. Completes once the source and every inner
    /// signal have completed.
    pub fn flat_map<U, F>(&self, derive: F) -> Signal<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> Signal<U> + Send + 'static,
    {
        let source = self.clone();
        let derive = Arc::new(Mutex::new(derive));
        Signal::deferred(move |emitter| {
            let ctx = Arc::new(FlatMapCtx {
                emitter,
                state: Mutex::new(FlatMapState {
                    pending: VecDeque::new(),
                    inner_active: false,
                    inner_gen: 0,
                    source_done: false,
                    inner_sub: None,
                }),
            });
            let derive = derive.clone();
            let ctx_next = ctx.clone();
            let ctx_err = ctx.clone();
            let ctx_done = ctx.clone();
            let source_sub = source.observe_with(
                move |value| {
                    let inner = {
                        let mut f = lock(&derive);
                        (*f)(value)
                    };
                    let start = {
                        let mut state = lock(&ctx_next.state);
                        if state.inner_active {
                            state.pending.push_back(inner);
                            None
                        } else {
                            state.inner_active = true;
                            Some(inner)
                        }
                    };
                    if let Some(inner) = start {
                        flat_map_drive(&ctx_next, inner);
                    }
                },
                move |error| ctx_err.emitter.error(error),
                move || {
                    let finish = {
                        let mut state = lock(&ctx_done.state);
                        state.source_done = true;
                        !state.inner_active && state.pending.is_empty()
                    };
                    if finish {
                        ctx_done.emitter.complete();
                    }
                },
            );
            Subscription::new(move || {
                source_sub.unsubscribe();
                if let Some(inner) = lock(&ctx.state).inner_sub.take() {
                    inner.unsubscribe();
                }
            })
        })
    }

    /// Latest-wins mapping: each source value cancels the previous inner
    /// subscription before subscribing to the new inner signal.
    pub fn switch_map<U, F>(&self, derive: F) -> Signal<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> Signal<U> + Send + 'static,
    {
        let source = self.clone();
        let derive = Arc::new(Mutex::new(derive));
        Signal::deferred(move |emitter| {
            struct SwitchState {
                inner_sub: Option<Subscription>,
                inner_active: bool,
                source_done: bool,
            }
            let state = Arc::new(Mutex::new(SwitchState {
                inner_sub: None,
                inner_active: false,
                source_done: false,
            }));
            let derive = derive.clone();
            let state_next = state.clone();
            let state_done = state.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            let source_sub = source.observe_with(
                move |value| {
                    let inner = {
                        let mut f = lock(&derive);
                        (*f)(value)
                    };
                    let previous = {
                        let mut state = lock(&state_next);
                        state.inner_active = true;
                        state.inner_sub.take()
                    };
                    if let Some(previous) = previous {
                        previous.unsubscribe();
                    }
                    let value_emitter = emitter.clone();
                    let inner_err = emitter.clone();
                    let inner_done = emitter.clone();
                    let state_inner = state_next.clone();
                    let subscription = inner.observe_with(
                        move |value| value_emitter.next(value),
                        move |error| inner_err.error(error),
                        move || {
                            let finish = {
                                let mut state = lock(&state_inner);
                                state.inner_active = false;
                                state.inner_sub = None;
                                state.source_done
                            };
                            if finish {
                                inner_done.complete();
                            }
                        },
                    );
                    let mut state = lock(&state_next);
                    if state.inner_active {
                        state.inner_sub = Some(subscription);
                    }
                },
                move |error| err.error(error),
                move || {
                    let finish = {
                        let mut state = lock(&state_done);
                        state.source_done = true;
                        !state.inner_active
                    };
                    if finish {
                        done.complete();
                    }
                },
            );
            Subscription::new(move || {
                source_sub.unsubscribe();
                if let Some(inner) = lock(&state).inner_sub.take() {
                    inner.unsubscribe();
                }
            })
        })
    }

    /// Replace an error with a freshly-subscribed fallback stream.
    pub fn recover_with<F>(&self, fallback: F) -> Signal<T>
    where
        F: FnMut(Error) -> Signal<T> + Send + 'static,
    {
        let source = self.clone();
        let fallback = Arc::new(Mutex::new(fallback));
        Signal::deferred(move |emitter| {
            let fallback = fallback.clone();
            let fallback_sub: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
            let fallback_sub2 = fallback_sub.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            let source_sub = source.observe_with(
                move |value| emitter.next(value),
                move |error| {
                    let replacement = {
                        let mut f = lock(&fallback);
                        (*f)(error)
                    };
                    let value_emitter = err.clone();
                    let inner_err = err.clone();
                    let inner_done = err.clone();
                    let subscription = replacement.observe_with(
                        move |value| value_emitter.next(value),
                        move |error| inner_err.error(error),
                        move || inner_done.complete(),
                    );
                    *lock(&fallback_sub2) = Some(subscription);
                },
                move || done.complete(),
            );
            Subscription::new(move || {
                source_sub.unsubscribe();
                if let Some(sub) = lock(&fallback_sub).take() {
                    sub.unsubscribe();
                }
            })
        })
    }

    /// Multicast one upstream subscription across all observers with
    /// reference counting: upstream is subscribed when the first observer
    /// attaches and released when the last one leaves.
    pub fn shared(&self) -> Signal<T> {
        self.multicast(false)
    }

    /// Like [`Signal::shared`], but additionally replays the most recently
    /// pushed value to each new observer. Termination is not replayed.
    pub fn sticky(&self) -> Signal<T> {
        self.multicast(true)
    }

    fn multicast(&self, replay_last: bool) -> Signal<T> {
        let source = self.clone();
        let core = Arc::new(Mutex::new(MulticastCore {
            subject: Signal::create(),
            upstream: None,
            starting: false,
            terminated: false,
            observers: 0,
            last: None,
        }));
        Signal::deferred(move |emitter| {
            let replay_emitter = emitter.clone();
            let (forward_sub, replay, start_upstream) = {
                let mut c = lock(&core);
                c.observers += 1;
                let replay = if replay_last { c.last.clone() } else { None };
                let err = emitter.clone();
                let done = emitter.clone();
                let forward = c.subject.observe_with(
                    move |value| emitter.next(value),
                    move |error| err.error(error),
                    move || done.complete(),
                );
                let start = c.upstream.is_none() && !c.starting && !c.terminated;
                if start {
                    c.starting = true;
                }
                (forward, replay, start)
            };
            if let Some(value) = replay {
                replay_emitter.next(value);
            }
            if start_upstream {
                let core_next = core.clone();
                let core_err = core.clone();
                let core_done = core.clone();
                let upstream = source.observe_with(
                    move |value: T| {
                        let subject = {
                            let mut c = lock(&core_next);
                            if replay_last {
                                c.last = Some(value.clone());
                            }
                            c.subject.clone()
                        };
                        subject.next(value);
                    },
                    move |error| {
                        let subject = {
                            let mut c = lock(&core_err);
                            c.upstream = None;
                            c.terminated = true;
                            std::mem::replace(&mut c.subject, Signal::create())
                        };
                        subject.error(error);
                    },
                    move || {
                        let subject = {
                            let mut c = lock(&core_done);
                            c.upstream = None;
                            c.terminated = true;
                            std::mem::replace(&mut c.subject, Signal::create())
                        };
                        subject.complete();
                    },
                );
                let mut c = lock(&core);
                c.starting = false;
                if c.observers > 0 {
                    c.upstream = Some(upstream);
                } else {
                    drop(c);
                    upstream.unsubscribe();
                }
            }
            let core = core.clone();
            Subscription::new(move || {
                forward_sub.unsubscribe();
                let released = {
                    let mut c = lock(&core);
                    c.observers -= 1;
                    if c.observers == 0 {
                        c.upstream.take()
                    } else {
                        None
                    }
                };
                if let Some(upstream) = released {
                    upstream.unsubscribe();
                }
            })
        })
    }

    /// Fail with [`Error::Timeout`] when no value or termination arrives
    /// within `window` of the previous one (or of subscribing). The timer
    /// resets on every value.
    ///
    /// Must be subscribed within a tokio runtime context.
    pub fn timeout(&self, window: Duration) -> Signal<T> {
        let source = self.clone();
        Signal::deferred(move |emitter| {
            let timer: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
            let arm: Arc<dyn Fn() + Send + Sync> = {
                let timer = timer.clone();
                let emitter = emitter.clone();
                Arc::new(move || {
                    let emitter = emitter.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        emitter.error(Error::Timeout(window));
                    });
                    if let Some(old) = lock(&timer).replace(handle) {
                        old.abort();
                    }
                })
            };
            let disarm: Arc<dyn Fn() + Send + Sync> = {
                let timer = timer.clone();
                Arc::new(move || {
                    if let Some(handle) = lock(&timer).take() {
                        handle.abort();
                    }
                })
            };
            arm();
            let arm_on_value = arm.clone();
            let disarm_err = disarm.clone();
            let disarm_done = disarm.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            let source_sub = source.observe_with(
                move |value| {
                    emitter.next(value);
                    arm_on_value();
                },
                move |error| {
                    disarm_err();
                    err.error(error);
                },
                move || {
                    disarm_done();
                    done.complete();
                },
            );
            Subscription::new(move || {
                source_sub.unsubscribe();
                disarm();
            })
        })
    }

    /// Shift values and completion later by `duration`, preserving order.
    /// Errors are delivered immediately.
    ///
    /// Must be subscribed within a tokio runtime context.
    pub fn delay(&self, duration: Duration) -> Signal<T> {
        let source = self.clone();
        Signal::deferred(move |emitter| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Relayed<T>>();
            let relay = emitter.clone();
            let task = tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    match item {
                        Relayed::Next(at, value) => {
                            tokio::time::sleep_until(at).await;
                            relay.next(value);
                        }
                        Relayed::Complete(at) => {
                            tokio::time::sleep_until(at).await;
                            relay.complete();
                        }
                        Relayed::Error(error) => relay.error(error),
                    }
                }
            });
            let tx_done = tx.clone();
            let err = emitter.clone();
            let source_sub = source.observe_with(
                move |value| {
                    let _ = tx.send(Relayed::Next(tokio::time::Instant::now() + duration, value));
                },
                move |error| err.error(error),
                move || {
                    let _ = tx_done.send(Relayed::Complete(
                        tokio::time::Instant::now() + duration,
                    ));
                },
            );
            Subscription::new(move || {
                source_sub.unsubscribe();
                task.abort();
            })
        })
    }

    /// Re-deliver all events on the given runtime context, preserving order.
    /// This is the only operator that changes execution context.
    pub fn observe_on(&self, handle: &tokio::runtime::Handle) -> Signal<T> {
        let source = self.clone();
        let handle = handle.clone();
        Signal::deferred(move |emitter| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Relayed<T>>();
            let relay = emitter.clone();
            let task = handle.spawn(async move {
                while let Some(item) = rx.recv().await {
                    match item {
                        Relayed::Next(_, value) => relay.next(value),
                        Relayed::Error(error) => relay.error(error),
                        Relayed::Complete(_) => relay.complete(),
                    }
                }
            });
            let tx_err = tx.clone();
            let tx_done = tx.clone();
            let now = tokio::time::Instant::now();
            let source_sub = source.observe_with(
                move |value| {
                    let _ = tx.send(Relayed::Next(now, value));
                },
                move |error| {
                    let _ = tx_err.send(Relayed::Error(error));
                },
                move || {
                    let _ = tx_done.send(Relayed::Complete(now));
                },
            );
            Subscription::new(move || {
                source_sub.unsubscribe();
                task.abort();
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<T: Clone + Send + 'static>(signal: &Signal<T>) -> (Arc<Mutex<Vec<T>>>, Subscription) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = values.clone();
        let sub = signal.observe_next(move |v| lock(&sink).push(v));
        (values, sub)
    }

    #[test]
    fn map_and_filter() {
        let source: Signal<u32> = Signal::create();
        let derived = source.map(|v| v * 10).filter(|v| *v >= 20);
        let (values, _sub) = collect(&derived);

        source.next(1);
        source.next(2);
        source.next(3);

        assert_eq!(*lock(&values), vec![20, 30]);
    }

    #[test]
    fn try_map_failure_terminates() {
        let source: Signal<u32> = Signal::create();
        let derived = source.try_map(|v| {
            if v == 0 {
                Err(Error::Codec("zero".into()))
            } else {
                Ok(v)
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let errors2 = errors.clone();
        let _sub = derived.observe_with(
            move |v| lock(&seen2).push(v),
            move |e| lock(&errors2).push(e),
            || {},
        );

        source.next(1);
        source.next(0);
        source.next(2);

        assert_eq!(*lock(&seen), vec![1]);
        assert_eq!(lock(&errors).len(), 1);
    }

    #[test]
    fn operators_subscribe_lazily() {
        let attaches = Arc::new(AtomicUsize::new(0));
        let attaches2 = attaches.clone();
        let source: Signal<u32> = Signal::deferred(move |emitter| {
            attaches2.fetch_add(1, Ordering::SeqCst);
            emitter.next(1);
            Subscription::resolved()
        });
        let derived = source.map(|v| v + 1);
        assert_eq!(attaches.load(Ordering::SeqCst), 0);
        let (values, _sub) = collect(&derived);
        assert_eq!(attaches.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&values), vec![2]);
    }

    #[test]
    fn distinct_until_changed_suppresses_consecutive_duplicates() {
        let source: Signal<u32> = Signal::create();
        let derived = source.distinct_until_changed();
        let (values, _sub) = collect(&derived);

        for v in [1, 1, 2, 2, 2, 1, 3, 3] {
            source.next(v);
        }

        assert_eq!(*lock(&values), vec![1, 2, 1, 3]);
    }

    #[test]
    fn take_completes_and_detaches() {
        let source: Signal<u32> = Signal::create();
        let derived = source.take(2);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let values = Arc::new(Mutex::new(Vec::new()));
        let values2 = values.clone();
        let _sub = derived.observe_with(
            move |v| lock(&values2).push(v),
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );

        source.next(1);
        source.next(2);
        source.next(3);

        assert_eq!(*lock(&values), vec![1, 2]);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn drop_first_skips() {
        let source: Signal<u32> = Signal::create();
        let derived = source.drop_first(2);
        let (values, _sub) = collect(&derived);
        for v in 1..=4 {
            source.next(v);
        }
        assert_eq!(*lock(&values), vec![3, 4]);
    }

    #[test]
    fn scan_accumulates() {
        let source: Signal<u32> = Signal::create();
        let derived = source.scan(0u32, |acc, v| acc + v);
        let (values, _sub) = collect(&derived);
        for v in [1, 2, 3] {
            source.next(v);
        }
        assert_eq!(*lock(&values), vec![1, 3, 6]);
    }

    #[test]
    fn scan_accepts_send_only_accumulator() {
        use std::cell::Cell;
        let source: Signal<u32> = Signal::create();
        let derived = source.scan(Cell::new(0u32), |acc, v| Cell::new(acc.get() + v));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = derived.observe_next(move |cell: Cell<u32>| lock(&seen2).push(cell.get()));
        source.next(2);
        source.next(3);
        assert_eq!(*lock(&seen), vec![2, 5]);
    }

    #[test]
    fn merge_completes_after_both() {
        let a: Signal<u32> = Signal::create();
        let b: Signal<u32> = Signal::create();
        let merged = a.merge(&b);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let values = Arc::new(Mutex::new(Vec::new()));
        let values2 = values.clone();
        let _sub = merged.observe_with(
            move |v| lock(&values2).push(v),
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );

        a.next(1);
        b.next(2);
        a.complete();
        assert!(!done.load(Ordering::SeqCst));
        b.next(3);
        b.complete();

        assert_eq!(*lock(&values), vec![1, 2, 3]);
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn flat_map_preserves_source_order() {
        let source: Signal<u32> = Signal::create();
        let inners: Arc<Mutex<Vec<Signal<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let inners2 = inners.clone();
        let derived = source.flat_map(move |_| {
            let inner: Signal<String> = Signal::create();
            lock(&inners2).push(inner.clone());
            inner
        });
        let (values, _sub) = collect(&derived);

        source.next(1);
        source.next(2);
        // Second inner emits first, but must be queued behind the first.
        {
            let inners = lock(&inners);
            assert_eq!(inners.len(), 2);
            inners[1].next("late".into());
            inners[0].next("a".into());
            inners[0].complete();
        }
        // Queued inner is only subscribed after the first completed, so its
        // pre-subscription push was never seen; push again now.
        lock(&inners)[1].next("b".into());
        lock(&inners)[1].complete();

        assert_eq!(*lock(&values), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn flat_map_completes_only_after_all_inners() {
        let source: Signal<u32> = Signal::create();
        let derived = source.flat_map(|v| Signal::just(v * 2));
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let values = Arc::new(Mutex::new(Vec::new()));
        let values2 = values.clone();
        let _sub = derived.observe_with(
            move |v| lock(&values2).push(v),
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );
        source.next(1);
        source.next(2);
        assert!(!done.load(Ordering::SeqCst));
        source.complete();
        assert_eq!(*lock(&values), vec![2, 4]);
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn switch_map_latest_wins() {
        let source: Signal<u32> = Signal::create();
        let inners: Arc<Mutex<Vec<Signal<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let inners2 = inners.clone();
        let derived = source.switch_map(move |_| {
            let inner: Signal<u32> = Signal::create();
            lock(&inners2).push(inner.clone());
            inner
        });
        let (values, _sub) = collect(&derived);

        source.next(1);
        lock(&inners)[0].next(10);
        source.next(2);
        // The first inner was cancelled by the switch.
        lock(&inners)[0].next(11);
        lock(&inners)[1].next(20);

        assert_eq!(*lock(&values), vec![10, 20]);
    }

    #[test]
    fn recover_with_switches_to_fallback() {
        let source: Signal<u32> = Signal::create();
        let fallback: Signal<u32> = Signal::create();
        let fb = fallback.clone();
        let derived = source.recover_with(move |_| fb.clone());
        let (values, _sub) = collect(&derived);

        source.next(1);
        source.error(Error::FragmentSequence);
        fallback.next(2);

        assert_eq!(*lock(&values), vec![1, 2]);
    }

    #[test]
    fn shared_multicasts_one_upstream() {
        let attaches = Arc::new(AtomicUsize::new(0));
        let detaches = Arc::new(AtomicUsize::new(0));
        let subject: Signal<u32> = Signal::create();
        let upstream = {
            let attaches = attaches.clone();
            let detaches = detaches.clone();
            let subject = subject.clone();
            Signal::deferred(move |emitter| {
                attaches.fetch_add(1, Ordering::SeqCst);
                let err = emitter.clone();
                let done = emitter.clone();
                let sub = subject.observe_with(
                    move |v| emitter.next(v),
                    move |e| err.error(e),
                    move || done.complete(),
                );
                let detaches = detaches.clone();
                Subscription::composite(vec![
                    sub,
                    Subscription::new(move || {
                        detaches.fetch_add(1, Ordering::SeqCst);
                    }),
                ])
            })
        };
        let shared = upstream.shared();

        let (a, sub_a) = collect(&shared);
        let (b, sub_b) = collect(&shared);
        assert_eq!(attaches.load(Ordering::SeqCst), 1);

        subject.next(5);
        assert_eq!(*lock(&a), vec![5]);
        assert_eq!(*lock(&b), vec![5]);

        sub_a.unsubscribe();
        assert_eq!(detaches.load(Ordering::SeqCst), 0);
        sub_b.unsubscribe();
        assert_eq!(detaches.load(Ordering::SeqCst), 1);

        // A new observer resubscribes upstream.
        let (_c, sub_c) = collect(&shared);
        assert_eq!(attaches.load(Ordering::SeqCst), 2);
        sub_c.unsubscribe();
    }

    #[test]
    fn sticky_replays_last_value_not_completion() {
        let subject: Signal<u32> = Signal::create();
        let sticky = subject.sticky();

        let (first, _sub_first) = collect(&sticky);
        subject.next(1);
        subject.next(2);
        assert_eq!(*lock(&first), vec![1, 2]);

        let (second, _sub_second) = collect(&sticky);
        assert_eq!(*lock(&second), vec![2]);

        subject.complete();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let replayed = Arc::new(Mutex::new(Vec::new()));
        let replayed2 = replayed.clone();
        let _late = sticky.observe_with(
            move |v| lock(&replayed2).push(v),
            |_| {},
            move || done2.store(true, Ordering::SeqCst),
        );
        // Last value is replayed; completion is not.
        assert_eq!(*lock(&replayed), vec![2]);
        assert!(!done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_without_values_and_resets_on_each_value() {
        let source: Signal<u32> = Signal::create();
        let derived = source.timeout(Duration::from_millis(100));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        let (values, _keep) = {
            let values = Arc::new(Mutex::new(Vec::new()));
            let sink = values.clone();
            let sub = derived.observe_with(
                move |v| lock(&sink).push(v),
                move |e| lock(&errors2).push(e),
                || {},
            );
            (values, sub)
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        source.next(1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        source.next(2);
        assert!(lock(&errors).is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*lock(&values), vec![1, 2]);
        assert_eq!(
            *lock(&errors),
            vec![Error::Timeout(Duration::from_millis(100))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delay_preserves_order() {
        let source: Signal<u32> = Signal::create();
        let derived = source.delay(Duration::from_millis(50));
        let (values, _sub) = collect(&derived);

        source.next(1);
        source.next(2);
        assert!(lock(&values).is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*lock(&values), vec![1, 2]);
    }

    #[tokio::test]
    async fn observe_on_hops_context_in_order() {
        let source: Signal<u32> = Signal::create();
        let derived = source.observe_on(&tokio::runtime::Handle::current());
        let (values, _sub) = collect(&derived);

        for v in 1..=5 {
            source.next(v);
        }
        // Delivery happens on the runtime; give the relay task a turn.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*lock(&values), vec![1, 2, 3, 4, 5]);
    }
}
