use crate::manager::{Shared, State};
use crate::signal::Signal;
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

const SC: Ordering = Ordering::SeqCst;

/// What a bookkeeping pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Completed,
    Reopened,
}

struct BarrierInner {
    name: String,
    counter: AtomicI64,
    // replaced (never reset in place) when a completed barrier reopens
    signal: Mutex<Signal>,
    owner: Weak<Shared>,
}

/// Handle to one named condition.
///
/// Every `create_barrier` call on the same name returns a handle to the same
/// condition, so clones and re-created handles all count against one counter.
/// The condition completes when the counter drops to zero, and reopens if
/// [`Barrier::add`] raises it again.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<BarrierInner>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("name", &self.inner.name)
            .field("count", &self.count())
            .finish()
    }
}

impl Barrier {
    pub(crate) fn new(name: &str, owner: Weak<Shared>) -> Self {
        Self {
            inner: Arc::new(BarrierInner {
                name: name.to_string(),
                counter: AtomicI64::new(1),
                signal: Mutex::new(Signal::new()),
                owner,
            }),
        }
    }

    /// A completed barrier that belongs to no manager, handed out once the
    /// manager has been cancelled.
    pub(crate) fn stand_in(name: &str) -> Self {
        Self {
            inner: Arc::new(BarrierInner {
                name: name.to_string(),
                counter: AtomicI64::new(0),
                signal: Mutex::new(Signal::fired()),
                owner: Weak::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current counter value. Never negative.
    pub fn count(&self) -> i64 {
        self.inner.counter.load(SC)
    }

    /// Whether the completion signal has fired.
    pub fn is_done(&self) -> bool {
        self.inner.signal.lock().is_fired()
    }

    /// Marks one unit of work as finished.
    ///
    /// Extra calls once the counter is already zero are ignored.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Adjusts the counter by `delta`, clamping at zero.
    ///
    /// Reaching zero completes the barrier; going from zero to a positive
    /// value reopens it so that later waits block again.
    pub fn add(&self, delta: i64) {
        let (old, new) = self.adjust(delta);
        if !crosses_zero(old, new) {
            return;
        }
        match self.inner.owner.upgrade() {
            Some(shared) => {
                let mut state = shared.state.write();
                self.reconcile(&mut state, &shared.label);
            }
            None => {
                self.sync_signal();
            }
        }
    }

    /// Same as [`Barrier::add`] for callers that already hold the manager lock.
    pub(crate) fn add_locked(&self, delta: i64, state: &mut State, label: &str) {
        let (old, new) = self.adjust(delta);
        if crosses_zero(old, new) {
            self.reconcile(state, label);
        }
    }

    /// Lock-free counter update. Returns the old and new values.
    fn adjust(&self, delta: i64) -> (i64, i64) {
        let mut old = self.inner.counter.load(SC);
        loop {
            let new = old.saturating_add(delta).max(0);
            if new == old {
                return (old, new);
            }
            match self
                .inner
                .counter
                .compare_exchange_weak(old, new, SC, SC)
            {
                Ok(_) => return (old, new),
                Err(current) => old = current,
            }
        }
    }

    /// Brings the signal in line with the counter as it is now.
    ///
    /// A concurrent `add` may have moved the counter again after the caller's
    /// CAS, so this looks at the live value rather than the caller's `new`.
    fn sync_signal(&self) -> Option<Transition> {
        let mut signal = self.inner.signal.lock();
        if self.count() == 0 {
            if signal.fire() {
                return Some(Transition::Completed);
            }
        } else if signal.is_fired() {
            *signal = Signal::new();
            return Some(Transition::Reopened);
        }
        None
    }

    /// Updates the signal together with the manager's completed set.
    /// Must be called with the manager's write lock held.
    pub(crate) fn reconcile(&self, state: &mut State, label: &str) -> Option<Transition> {
        let transition = self.sync_signal();
        match transition {
            Some(Transition::Completed) => {
                state.completed.insert(self.inner.name.clone());
                debug!("{}: barrier '{}' completed", label, self.inner.name);
                metrics::counter!("cond_barrier.completed", "manager" => label.to_string())
                    .increment(1);
            }
            Some(Transition::Reopened) => {
                state.completed.remove(&self.inner.name);
                debug!(
                    "{}: barrier '{}' reopened with count {}",
                    label,
                    self.inner.name,
                    self.count()
                );
                metrics::counter!("cond_barrier.reopened", "manager" => label.to_string())
                    .increment(1);
            }
            None => trace!("{}: barrier '{}' already in sync", label, self.inner.name),
        }
        transition
    }

    /// Drops the counter to zero and completes the barrier. Manager lock held.
    pub(crate) fn force_complete(&self, state: &mut State, label: &str) {
        self.inner.counter.store(0, SC);
        self.reconcile(state, label);
    }

    pub(crate) fn signal(&self) -> Signal {
        self.inner.signal.lock().clone()
    }
}

fn crosses_zero(old: i64, new: i64) -> bool {
    (old == 0) != (new == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_crosses_zero() {
        assert!(crosses_zero(1, 0));
        assert!(crosses_zero(0, 3));
        assert!(!crosses_zero(0, 0));
        assert!(!crosses_zero(2, 1));
    }

    #[test]
    fn test_detached_done_and_add() {
        let b = Barrier::new("x", Weak::new());
        assert_eq!(b.count(), 1);
        assert!(!b.is_done());
        b.done();
        assert_eq!(b.count(), 0);
        assert!(b.is_done());

        // excess done is clamped
        b.done();
        b.done();
        assert_eq!(b.count(), 0);
        assert!(b.is_done());

        let old_signal = b.signal();
        b.add(2);
        assert_eq!(b.count(), 2);
        assert!(!b.is_done());
        assert!(!old_signal.ptr_eq(&b.signal()));
        assert!(old_signal.is_fired());

        b.add(-10);
        assert_eq!(b.count(), 0);
        assert!(b.is_done());
    }

    #[test]
    fn test_stand_in_is_completed() {
        let b = Barrier::stand_in("late");
        assert_eq!(b.name(), "late");
        assert_eq!(b.count(), 0);
        assert!(b.is_done());
        b.done();
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn test_counter_never_negative() {
        let b = Barrier::new("c", Weak::new());
        b.add(1000);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let b = b.clone();
                thread::spawn(move || {
                    for j in 0..500 {
                        if (i + j) % 3 == 0 {
                            b.add(2);
                        } else {
                            b.done();
                        }
                        assert!(b.count() >= 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(b.count() >= 0);
        assert_eq!(b.count() == 0, b.is_done());
    }
}
