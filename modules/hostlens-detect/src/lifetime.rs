//! Fire-once termination signals and the pool that joins several of them.
//!
//! A node's visual presence can be torn down by several independent causes
//! (removal, navigation, an explicit destroy). [`LifetimeStopperPool`] fires
//! its aggregate signal only once every input it was handed has fired.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifetimeError {
    #[error("cannot add a signal to a lifetime pool that has already fired")]
    PoolAlreadyFired,

    #[error("a lifetime pool needs at least one input signal")]
    EmptyPool,
}

type Listener = Box<dyn FnOnce() + Send>;

/// Cloneable, edge-triggered, fire-once signal.
///
/// Clones share state: firing any clone fires them all.
#[derive(Clone)]
pub struct TerminationSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    token: CancellationToken,
}

struct SignalState {
    fired: bool,
    listeners: Vec<Listener>,
}

impl TerminationSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    fired: false,
                    listeners: Vec::new(),
                }),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Fire the signal. Returns true only for the call that actually fired it.
    ///
    /// Listeners run synchronously on the firing thread, after the internal
    /// lock is released, so a listener may freely touch other signals.
    pub fn fire(&self) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock().expect("signal lock poisoned");
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.listeners)
        };
        self.inner.token.cancel();
        for listener in listeners {
            listener();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.state.lock().expect("signal lock poisoned").fired
    }

    /// Completes once the signal has fired (immediately if it already has).
    pub async fn fired(&self) {
        self.inner.token.cancelled().await;
    }

    /// Run `callback` when the signal fires, or right away if it already has.
    pub fn on_fire(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().expect("signal lock poisoned");
        if state.fired {
            drop(state);
            callback();
        } else {
            state.listeners.push(Box::new(callback));
        }
    }

    /// Token cancelled when the signal fires, for use in `tokio::select!`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// True when both handles refer to the same underlying signal.
    pub fn same_signal(&self, other: &TerminationSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LifetimeStopperPool
// ---------------------------------------------------------------------------

/// Aggregates N termination signals into one that fires when all have fired.
///
/// Once the aggregate has fired the pool is terminal: [`add`](Self::add)
/// returns [`LifetimeError::PoolAlreadyFired`].
#[derive(Clone)]
pub struct LifetimeStopperPool {
    state: Arc<Mutex<PoolState>>,
    signal: TerminationSignal,
}

struct PoolState {
    size: usize,
    remaining: usize,
    fired: bool,
}

impl LifetimeStopperPool {
    pub fn new(first: TerminationSignal) -> Self {
        let pool = Self {
            state: Arc::new(Mutex::new(PoolState {
                size: 0,
                remaining: 0,
                fired: false,
            })),
            signal: TerminationSignal::new(),
        };
        pool.register(first);
        pool
    }

    pub fn from_signals(
        signals: impl IntoIterator<Item = TerminationSignal>,
    ) -> Result<Self, LifetimeError> {
        let mut signals = signals.into_iter();
        let first = signals.next().ok_or(LifetimeError::EmptyPool)?;
        let pool = Self::new(first);
        for signal in signals {
            pool.add(signal)?;
        }
        Ok(pool)
    }

    /// Register one more input. An input that already fired counts as fired.
    pub fn add(&self, signal: TerminationSignal) -> Result<(), LifetimeError> {
        if self.state.lock().expect("pool lock poisoned").fired {
            return Err(LifetimeError::PoolAlreadyFired);
        }
        self.register(signal);
        Ok(())
    }

    fn register(&self, input: TerminationSignal) {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            state.size += 1;
            state.remaining += 1;
        }

        let state = Arc::clone(&self.state);
        let aggregate = self.signal.clone();
        input.on_fire(move || {
            let done = {
                let mut state = state.lock().expect("pool lock poisoned");
                state.remaining -= 1;
                if state.remaining == 0 && !state.fired {
                    state.fired = true;
                    true
                } else {
                    false
                }
            };
            if done {
                aggregate.fire();
            }
        });
    }

    /// Number of inputs ever registered.
    pub fn size(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").size
    }

    /// The aggregate signal.
    pub fn signal(&self) -> TerminationSignal {
        self.signal.clone()
    }

    pub fn is_fired(&self) -> bool {
        self.signal.is_fired()
    }
}

impl fmt::Debug for LifetimeStopperPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("pool lock poisoned");
        f.debug_struct("LifetimeStopperPool")
            .field("size", &state.size)
            .field("remaining", &state.remaining)
            .field("fired", &state.fired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn signal_fires_exactly_once() {
        let signal = TerminationSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        signal.on_fire(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_on_fired_signal_runs_immediately() {
        let signal = TerminationSignal::new();
        signal.fire();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        signal.on_fire(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_state() {
        let a = TerminationSignal::new();
        let b = a.clone();
        b.fire();
        assert!(a.is_fired());
        assert!(a.same_signal(&b));
        assert!(!a.same_signal(&TerminationSignal::new()));
    }

    #[tokio::test]
    async fn fired_future_completes_after_fire() {
        let signal = TerminationSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.fired().await });
        signal.fire();
        handle.await.unwrap();
        assert!(signal.cancellation_token().is_cancelled());
    }

    #[test]
    fn pool_fires_only_after_all_inputs() {
        let a = TerminationSignal::new();
        let b = TerminationSignal::new();
        let c = TerminationSignal::new();
        let pool = LifetimeStopperPool::from_signals([a.clone(), b.clone()]).unwrap();
        pool.add(c.clone()).unwrap();
        assert_eq!(pool.size(), 3);

        a.fire();
        c.fire();
        assert!(!pool.is_fired());
        b.fire();
        assert!(pool.is_fired());
        assert!(pool.signal().is_fired());
    }

    #[test]
    fn add_to_fired_pool_fails_loudly() {
        let a = TerminationSignal::new();
        let pool = LifetimeStopperPool::new(a.clone());
        a.fire();
        assert_eq!(
            pool.add(TerminationSignal::new()),
            Err(LifetimeError::PoolAlreadyFired)
        );
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn already_fired_input_counts_immediately() {
        let live = TerminationSignal::new();
        let dead = TerminationSignal::new();
        dead.fire();

        let pool = LifetimeStopperPool::new(live.clone());
        pool.add(dead).unwrap();
        assert!(!pool.is_fired());
        live.fire();
        assert!(pool.is_fired());
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = LifetimeStopperPool::from_signals(Vec::new()).unwrap_err();
        assert_eq!(err, LifetimeError::EmptyPool);
    }

    #[test]
    fn aggregate_fires_once_even_if_inputs_refire() {
        let a = TerminationSignal::new();
        let pool = LifetimeStopperPool::new(a.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        pool.signal().on_fire(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        a.fire();
        a.fire();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
