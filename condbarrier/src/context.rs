//! Cancellation and deadline propagation for blocking waits.
//!
//! A [`Context`] ends either because someone called [`CancelHandle::cancel`]
//! on it (or on an ancestor), or because its deadline passed. Ending is
//! pushed down the tree: every context keeps weak references to its children
//! and ends them together with itself, so no watcher thread is required.
//!
//! Deadlines are observed lazily. A blocked waiter includes
//! [`Context::deadline`] in its own select and calls [`Context::err`] once it
//! wakes up; the first observer past the deadline ends the context with
//! [`ContextError::DeadlineExceeded`].

use crate::error::ContextError;
use crate::signal::Signal;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct ContextState {
    err: Option<ContextError>,
    children: Vec<Weak<ContextInner>>,
}

struct ContextInner {
    /// effective deadline, already folded with every ancestor's
    deadline: Option<Instant>,
    done: Signal,
    state: Mutex<ContextState>,
}

impl ContextInner {
    fn new(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            done: Signal::new(),
            state: Mutex::new(ContextState {
                err: None,
                children: Vec::new(),
            }),
        }
    }

    fn end(&self, err: ContextError) {
        let children = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err);
            self.done.fire();
            std::mem::take(&mut state.children)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.end(err);
        }
    }

    /// Registers `child` so it ends with `self`. If `self` already ended the
    /// child ends right away with the same error.
    fn adopt(&self, child: &Arc<ContextInner>) {
        let ended = {
            let mut state = self.state.lock();
            match state.err {
                Some(err) => Some(err),
                None => {
                    state.children.retain(|c| c.strong_count() > 0);
                    state.children.push(Arc::downgrade(child));
                    None
                }
            }
        };
        if let Some(err) = ended {
            child.end(err);
        }
    }
}

/// A cancellation scope that can be handed to blocking waits.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// Ends the [`Context`] it was created with.
///
/// Dropping the handle does not cancel anything.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<ContextInner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.end(ContextError::Canceled);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.inner.state.lock().err)
            .finish()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Context {
    /// A context that never ends.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(ContextInner::new(None)),
        }
    }

    fn child_of(parents: &[&Context], deadline: Option<Instant>) -> (Context, CancelHandle) {
        let deadline = parents
            .iter()
            .fold(deadline, |d, p| earliest(d, p.inner.deadline));
        let inner = Arc::new(ContextInner::new(deadline));
        for parent in parents {
            parent.inner.adopt(&inner);
        }
        let handle = CancelHandle {
            inner: inner.clone(),
        };
        (Context { inner }, handle)
    }

    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        Self::child_of(&[parent], None)
    }

    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        Self::child_of(&[parent], Some(deadline))
    }

    /// A timeout too large to represent as an `Instant` means no deadline.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        Self::child_of(&[parent], Instant::now().checked_add(timeout))
    }

    /// A context that ends as soon as either `a` or `b` ends.
    pub fn merge(a: &Context, b: &Context) -> (Context, CancelHandle) {
        Self::child_of(&[a, b], None)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Receiver that becomes ready once the context has been cancelled.
    ///
    /// An elapsed deadline only shows up here after someone observed it
    /// through [`Context::err`]; pair the receiver with
    /// [`Context::deadline`] when selecting.
    pub fn done(&self) -> &Receiver<()> {
        self.inner.done.receiver()
    }

    /// Why the context ended, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(err) = self.inner.state.lock().err {
            return Some(err);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.inner.end(ContextError::DeadlineExceeded);
                self.inner.state.lock().err
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Blocks until the context ends and returns the reason.
    pub fn wait(&self) -> ContextError {
        match self.inner.deadline {
            Some(deadline) => {
                self.inner.done.wait_deadline(deadline);
            }
            None => self.inner.done.wait(),
        }
        self.err().unwrap_or(ContextError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_background_never_ends() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.done().try_recv().is_err());
        assert!(!ctx.is_done());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let root = Context::background();
        let (parent, cancel) = Context::with_cancel(&root);
        let (child, _) = Context::with_cancel(&parent);
        let (grandchild, _) = Context::with_timeout(&child, Duration::from_secs(60));

        cancel.cancel();
        cancel.cancel();
        assert_eq!(parent.err(), Some(ContextError::Canceled));
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
        assert!(root.err().is_none());
    }

    #[test]
    fn test_child_of_ended_parent_is_born_ended() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();
        let (child, _) = Context::with_cancel(&parent);
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_cancelling_child_leaves_parent() {
        let (parent, _) = Context::with_cancel(&Context::background());
        let (child, cancel) = Context::with_cancel(&parent);
        cancel.cancel();
        assert!(child.is_done());
        assert!(parent.err().is_none());
    }

    #[test]
    fn test_deadline_exceeded() {
        let (ctx, _) = Context::with_timeout(&Context::background(), Duration::from_millis(30));
        assert!(ctx.err().is_none());
        let start = Instant::now();
        assert_eq!(ctx.wait(), ContextError::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(ctx.err().unwrap().is_deadline());
        // observed deadline also fires done
        assert!(ctx.done().try_recv().is_err());
        assert!(ctx.inner.done.is_fired());
    }

    #[test]
    fn test_unrepresentable_timeout_has_no_deadline() {
        let (ctx, cancel) = Context::with_timeout(&Context::background(), Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());

        let (bounded, _) = Context::with_timeout(&Context::background(), Duration::from_secs(60));
        let (child, _) = Context::with_timeout(&bounded, Duration::MAX);
        assert_eq!(child.deadline(), bounded.deadline());

        cancel.cancel();
        assert_eq!(ctx.wait(), ContextError::Canceled);
    }

    #[test]
    fn test_deadline_is_inherited() {
        let (parent, _) = Context::with_timeout(&Context::background(), Duration::from_millis(10));
        let (child, _) = Context::with_timeout(&parent, Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn test_merge_ends_with_either_parent() {
        let (a, cancel_a) = Context::with_cancel(&Context::background());
        let (b, cancel_b) = Context::with_cancel(&Context::background());
        let (m1, _) = Context::merge(&a, &b);
        let (m2, _) = Context::merge(&a, &b);

        cancel_b.cancel();
        assert!(m1.is_done());
        assert!(m2.is_done());
        assert!(a.err().is_none());
        cancel_a.cancel();
    }

    #[test]
    fn test_wait_wakes_on_cancel() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let c = ctx.clone();
        let h = thread::spawn(move || c.wait());
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert_eq!(h.join().unwrap(), ContextError::Canceled);
    }

    #[test]
    fn test_dead_children_are_pruned() {
        let (parent, _) = Context::with_cancel(&Context::background());
        for _ in 0..100 {
            let _ = Context::with_cancel(&parent);
        }
        assert!(parent.inner.state.lock().children.len() <= 1);
    }
}
