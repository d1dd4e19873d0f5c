//! One-shot completion signal backed by a crossbeam channel.
//!
//! A signal never carries a message. Firing it drops the only sender, which
//! disconnects the channel and makes every clone of the receiver permanently
//! ready. Any number of waiters can therefore block on the same signal, and a
//! `crossbeam::channel::Select` can wait on an arbitrary number of them at once.

use crossbeam::channel::{bounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

struct SignalInner {
    /// `None` once the signal has fired
    trigger: Mutex<Option<Sender<()>>>,
    fired: Receiver<()>,
}

/// A cloneable handle to a one-shot event.
///
/// Clones share the same event. A "reset" is modelled by replacing the handle
/// with a fresh `Signal::new()`, so waiters holding the old handle are never
/// confused by a reopened event.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            inner: Arc::new(SignalInner {
                trigger: Mutex::new(Some(sender)),
                fired: receiver,
            }),
        }
    }

    /// Creates a signal that has already fired.
    pub fn fired() -> Self {
        let signal = Self::new();
        signal.fire();
        signal
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.inner.trigger.lock().take().is_some()
    }

    pub fn is_fired(&self) -> bool {
        self.inner.trigger.lock().is_none()
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.fired
    }

    /// Blocks the current thread until the signal fires.
    pub fn wait(&self) {
        // nothing is ever sent, so recv only returns on disconnect
        let _ = self.inner.fired.recv();
    }

    /// Blocks until the signal fires or `deadline` passes. Returns whether it fired.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        let _ = self.inner.fired.recv_deadline(deadline);
        self.is_fired()
    }

    pub fn ptr_eq(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Outcome of [`wait_first`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The receiver at this index in the `signals` slice became ready
    Signal(usize),
    /// The context receiver became ready
    Context,
    /// The deadline passed before anything became ready
    Deadline,
}

/// Blocks until the first of `signals` fires, `ctx_done` becomes ready or
/// `deadline` passes.
///
/// The number of signals is only known at call time, so the wait is built
/// with a dynamic `Select` rather than the `select!` macro.
pub(crate) fn wait_first(
    signals: &[Receiver<()>],
    ctx_done: &Receiver<()>,
    deadline: Option<Instant>,
) -> Wake {
    let mut sel = Select::new();
    for rx in signals {
        sel.recv(rx);
    }
    let ctx_idx = sel.recv(ctx_done);

    let idx = match deadline {
        Some(deadline) => match sel.ready_deadline(deadline) {
            Ok(idx) => idx,
            Err(_) => return Wake::Deadline,
        },
        None => sel.ready(),
    };
    if idx == ctx_idx {
        Wake::Context
    } else {
        Wake::Signal(idx)
    }
}
