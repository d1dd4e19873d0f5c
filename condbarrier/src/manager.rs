//! The condition-barrier manager.
//!
//! Barrier counters are updated lock-free. Everything else (the name to
//! barrier map, the completed set, waiters for names that do not exist yet
//! and the cancelled flag) lives behind one `RwLock`. Signals are fired and
//! replaced only while that lock is held for writing, so a waiter that
//! captured a signal under the lock never sees a stale one. No thread blocks
//! while holding the lock.

use crate::barrier::Barrier;
use crate::config::Config;
use crate::context::{CancelHandle, Context};
use crate::error::ContextError;
use crate::signal::{wait_first, Signal, Wake};
use crossbeam::channel::Receiver;
use log::{debug, trace};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct State {
    pub(crate) barriers: HashMap<String, Barrier>,
    pub(crate) completed: HashSet<String>,
    // waiters for names nobody has created yet
    pub(crate) waiters: HashMap<String, Vec<Signal>>,
    pub(crate) cancelled: bool,
}

impl State {
    fn new() -> Self {
        Self {
            barriers: HashMap::new(),
            completed: HashSet::new(),
            waiters: HashMap::new(),
            cancelled: false,
        }
    }

    fn forget_waiter(&mut self, name: &str, signal: &Signal) {
        if let Some(list) = self.waiters.get_mut(name) {
            list.retain(|s| !s.ptr_eq(signal));
            if list.is_empty() {
                self.waiters.remove(name);
            }
        }
    }

    fn open_barriers(&self) -> Vec<Barrier> {
        self.barriers
            .iter()
            .filter(|(name, _)| !self.completed.contains(*name))
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Result of a wait that was woken by its context.
    fn interrupted(&self, ctx: &Context) -> Result<(), ContextError> {
        if self.cancelled {
            return Ok(());
        }
        Err(ctx.err().unwrap_or(ContextError::Canceled))
    }
}

pub(crate) struct Shared {
    pub(crate) state: RwLock<State>,
    pub(crate) label: String,
    ctx: Context,
    cancel: CancelHandle,
    wait_timeout: Option<Duration>,
}

enum Pending {
    /// the barrier exists, wait for it to complete
    Completion(Signal),
    /// the name is unknown, wait for someone to create it
    Creation(Signal),
}

/// Manager of named, reentrant barriers.
///
/// Producers call [`CondBarrier::create_barrier`] and later
/// [`Barrier::done`]; consumers call [`CondBarrier::wait`] or
/// [`CondBarrier::wait_all`], possibly before the names they wait on exist.
/// [`CondBarrier::cancel`] releases every waiter with success.
///
/// The handle is cheap to clone and all clones share the same manager.
///
/// ```
/// use condbarrier::CondBarrier;
/// use std::thread;
///
/// let cb = CondBarrier::new();
/// let worker = {
///     let cb = cb.clone();
///     thread::spawn(move || {
///         let barrier = cb.create_barrier("load");
///         barrier.done();
///     })
/// };
/// cb.wait(&["load"]).unwrap();
/// worker.join().unwrap();
/// ```
#[derive(Clone)]
pub struct CondBarrier {
    shared: Arc<Shared>,
}

impl Default for CondBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CondBarrier {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// A manager whose waits fail once `parent` ends.
    pub fn with_parent(parent: &Context) -> Self {
        Self::with_config(Config::default().with_parent(parent.clone()))
    }

    pub fn with_config(config: Config) -> Self {
        let parent = config.parent.unwrap_or_default();
        let (ctx, cancel) = Context::with_cancel(&parent);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::new()),
                label: config.label,
                ctx,
                cancel,
                wait_timeout: config.wait_timeout,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// The manager's own context. It ends on [`CondBarrier::cancel`] or when
    /// the parent context ends.
    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }

    /// Registers one unit of pending work under `name`.
    ///
    /// The first call creates the barrier with a count of one; later calls
    /// add one to the same counter. After [`CondBarrier::cancel`] this
    /// returns a detached barrier that is already complete.
    pub fn create_barrier(&self, name: &str) -> Barrier {
        let label = &self.shared.label;
        let mut state = self.shared.state.write();
        if state.cancelled {
            trace!("{}: cancelled, '{}' handed a completed barrier", label, name);
            return Barrier::stand_in(name);
        }

        if let Some(barrier) = state.barriers.get(name).cloned() {
            barrier.add_locked(1, &mut state, label);
            trace!("{}: joined '{}' count={}", label, name, barrier.count());
            metrics::counter!("cond_barrier.joined", "manager" => label.clone()).increment(1);
            return barrier;
        }

        let barrier = Barrier::new(name, Arc::downgrade(&self.shared));
        state.barriers.insert(name.to_string(), barrier.clone());
        let woken = match state.waiters.remove(name) {
            Some(waiters) => {
                waiters.iter().for_each(|s| {
                    s.fire();
                });
                waiters.len()
            }
            None => 0,
        };
        debug!("{}: created '{}', woke {} waiters", label, name, woken);
        metrics::counter!("cond_barrier.created", "manager" => label.clone()).increment(1);
        barrier
    }

    /// Completes every open barrier and releases all current and future
    /// waits with success. Later calls do nothing.
    pub fn cancel(&self) {
        let label = &self.shared.label;
        {
            let mut state = self.shared.state.write();
            if state.cancelled {
                return;
            }
            state.cancelled = true;

            let open = state.open_barriers();
            for barrier in open.iter() {
                barrier.force_complete(&mut state, label);
            }
            let mut released = 0;
            for (_, waiters) in state.waiters.drain() {
                released += waiters.len();
                for s in waiters {
                    s.fire();
                }
            }
            debug!(
                "{}: cancelled, forced {} barriers, released {} creation waiters",
                label,
                open.len(),
                released
            );
        }
        metrics::counter!("cond_barrier.cancelled", "manager" => label.clone()).increment(1);
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.read().cancelled
    }

    /// Whether `name` exists and its counter is currently zero.
    pub fn is_completed(&self, name: &str) -> bool {
        self.shared.state.read().completed.contains(name)
    }

    /// Names of every barrier created so far, sorted.
    pub fn barrier_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.read().barriers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of waits currently parked on names that were never created.
    pub fn pending_waiter_count(&self) -> usize {
        self.shared.state.read().waiters.values().map(Vec::len).sum()
    }

    /// Waits for every name in order, stopping at the first error.
    /// An empty list waits for all barriers, see [`CondBarrier::wait_all`].
    ///
    /// Names that do not exist yet are waited on until they are created and
    /// completed. Without cancellation or a configured timeout, such a wait
    /// can block forever.
    pub fn wait(&self, names: &[&str]) -> Result<(), ContextError> {
        match self.shared.wait_timeout {
            Some(timeout) => {
                let (ctx, cancel) = Context::with_timeout(&self.shared.ctx, timeout);
                let res = self.wait_in(&ctx, names);
                cancel.cancel();
                res
            }
            None => self.wait_in(&self.shared.ctx, names),
        }
    }

    /// Like [`CondBarrier::wait`], but also gives up when `ctx` ends.
    ///
    /// Returns `ctx`'s error in that case, unless the manager was cancelled,
    /// which always counts as success.
    pub fn wait_context(&self, ctx: &Context, names: &[&str]) -> Result<(), ContextError> {
        let (merged, cancel) = Context::merge(ctx, &self.shared.ctx);
        let res = self.wait_in(&merged, names);
        cancel.cancel();
        res
    }

    /// Waits until no barrier is open.
    ///
    /// Barriers created while waiting are waited on too, so this returns only
    /// once everything that exists has completed, or on cancellation.
    pub fn wait_all(&self) -> Result<(), ContextError> {
        self.wait(&[])
    }

    pub fn wait_all_context(&self, ctx: &Context) -> Result<(), ContextError> {
        self.wait_context(ctx, &[])
    }

    fn wait_in(&self, ctx: &Context, names: &[&str]) -> Result<(), ContextError> {
        let start = Instant::now();
        let res = if names.is_empty() {
            self.wait_all_in(ctx)
        } else {
            names.iter().try_for_each(|name| self.wait_single(ctx, name))
        };
        let label = self.shared.label.clone();
        metrics::histogram!("cond_barrier.wait_seconds", "manager" => label.clone())
            .record(start.elapsed().as_secs_f64());
        if let Err(err) = &res {
            debug!("{}: wait on {:?} failed: {}", label, names, err);
            metrics::counter!("cond_barrier.wait_errors", "manager" => label).increment(1);
        }
        res
    }

    /// What a wait on `name` has to block on, or `None` if it can return.
    ///
    /// Only a name that does not exist yet needs the write lock, to register
    /// a creation waiter.
    fn pending(&self, name: &str) -> Option<Pending> {
        {
            let state = self.shared.state.read();
            if state.cancelled || state.completed.contains(name) {
                return None;
            }
            if let Some(barrier) = state.barriers.get(name) {
                return Some(Pending::Completion(barrier.signal()));
            }
        }
        let mut state = self.shared.state.write();
        // the name may have been created, or the manager cancelled, in between
        if state.cancelled || state.completed.contains(name) {
            return None;
        }
        if let Some(barrier) = state.barriers.get(name) {
            return Some(Pending::Completion(barrier.signal()));
        }
        let signal = Signal::new();
        state
            .waiters
            .entry(name.to_string())
            .or_default()
            .push(signal.clone());
        Some(Pending::Creation(signal))
    }

    fn wait_single(&self, ctx: &Context, name: &str) -> Result<(), ContextError> {
        loop {
            let Some(pending) = self.pending(name) else {
                return Ok(());
            };
            let signal = match &pending {
                Pending::Completion(s) | Pending::Creation(s) => s,
            };
            let wake = wait_first(
                std::slice::from_ref(signal.receiver()),
                ctx.done(),
                ctx.deadline(),
            );

            // select readiness can be spurious, trust only the real state
            if signal.is_fired() {
                match pending {
                    Pending::Completion(_) => return Ok(()),
                    Pending::Creation(_) => {
                        // created, or cancelled; either way look again
                        trace!("{}: '{}' appeared, re-checking", self.shared.label, name);
                        continue;
                    }
                }
            }
            let ended = ctx.err().is_some();
            let mut state = self.shared.state.write();
            if let Pending::Creation(s) = &pending {
                state.forget_waiter(name, s);
            }
            if ended {
                return state.interrupted(ctx);
            }
            trace!("{}: spurious {:?} waiting on '{}'", self.shared.label, wake, name);
        }
    }

    fn wait_all_in(&self, ctx: &Context) -> Result<(), ContextError> {
        loop {
            let open: Vec<Receiver<()>> = {
                let state = self.shared.state.read();
                if state.cancelled {
                    return Ok(());
                }
                state
                    .open_barriers()
                    .iter()
                    .map(|b| b.signal().receiver().clone())
                    .collect()
            };
            if open.is_empty() {
                return Ok(());
            }
            trace!("{}: wait_all on {} open barriers", self.shared.label, open.len());
            match wait_first(&open, ctx.done(), ctx.deadline()) {
                // the next snapshot tells whether anything really completed
                Wake::Signal(_) => continue,
                Wake::Context | Wake::Deadline => {
                    if ctx.err().is_some() {
                        return self.shared.state.read().interrupted(ctx);
                    }
                    trace!("{}: spurious wake in wait_all", self.shared.label);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_wait(cb: &CondBarrier, name: &'static str) -> crossbeam::channel::Receiver<Result<(), ContextError>> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let cb = cb.clone();
        thread::spawn(move || {
            let _ = tx.send(cb.wait(&[name]));
        });
        rx
    }

    #[test]
    fn test_create_and_join() {
        let cb = CondBarrier::new();
        let a = cb.create_barrier("a");
        let a2 = cb.create_barrier("a");
        assert_eq!(a.count(), 2);
        assert_eq!(a2.count(), 2);
        assert!(!cb.is_completed("a"));

        a.done();
        assert!(!cb.is_completed("a"));
        a2.done();
        assert!(cb.is_completed("a"));
        assert_eq!(cb.barrier_names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_completed_set_tracks_signal() {
        let cb = CondBarrier::new();
        let b = cb.create_barrier("b");
        b.done();
        assert!(cb.is_completed("b") && b.is_done());

        b.add(1);
        assert!(!cb.is_completed("b") && !b.is_done());

        // joining a completed barrier reopens it as well
        b.done();
        let again = cb.create_barrier("b");
        assert_eq!(again.count(), 1);
        assert!(!cb.is_completed("b"));
        again.done();
        assert!(cb.is_completed("b"));
    }

    #[test]
    fn test_waiter_registered_then_woken_by_creation() {
        let cb = CondBarrier::new();
        let rx = spawn_wait(&cb, "later");

        let start = Instant::now();
        while cb.pending_waiter_count() == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        let b = cb.create_barrier("later");
        assert_eq!(cb.pending_waiter_count(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        b.done();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
    }

    #[test]
    fn test_known_names_need_only_read_lock() {
        let cb = CondBarrier::new();
        cb.create_barrier("done").done();
        let open = cb.create_barrier("open");

        let reader = cb.shared.state.read();
        assert_eq!(cb.wait(&["done"]), Ok(()));
        assert!(matches!(cb.pending("open"), Some(Pending::Completion(_))));
        drop(reader);

        assert!(matches!(cb.pending("ghost"), Some(Pending::Creation(_))));
        assert_eq!(cb.pending_waiter_count(), 1);
        open.done();
        assert!(cb.pending("open").is_none());
    }

    #[test]
    fn test_context_timeout_deregisters_waiter() {
        let cb = CondBarrier::new();
        let (ctx, _) = Context::with_timeout(&Context::background(), Duration::from_millis(30));
        assert_eq!(
            cb.wait_context(&ctx, &["ghost"]),
            Err(ContextError::DeadlineExceeded)
        );
        assert_eq!(cb.pending_waiter_count(), 0);
    }

    #[test]
    fn test_cancel_forces_open_barriers() {
        let cb = CondBarrier::new();
        let a = cb.create_barrier("a");
        a.add(5);
        let done = cb.create_barrier("done");
        done.done();

        cb.cancel();
        assert!(cb.is_cancelled());
        assert_eq!(a.count(), 0);
        assert!(a.is_done());
        assert!(cb.is_completed("a"));
        assert!(cb.context().is_done());

        let late = cb.create_barrier("late");
        assert!(late.is_done());
        assert_eq!(cb.barrier_names(), vec!["a".to_string(), "done".to_string()]);
    }

    #[test]
    fn test_barrier_outlives_manager() {
        let b = {
            let cb = CondBarrier::new();
            cb.create_barrier("orphan")
        };
        b.add(1);
        b.done();
        b.done();
        assert!(b.is_done());
    }
}
