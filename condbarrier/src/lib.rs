//! Named, reentrant condition barriers.
//!
//! # Overview
//! A [`CondBarrier`] lets independent threads announce work under a name and
//! lets other threads wait for that work, for several names, or for
//! everything, including names that have not been announced yet.
//!
//! - [`CondBarrier::create_barrier`] registers one unit of work. Calling it
//!   again with the same name joins the existing counter, much like a
//!   wait group.
//! - [`Barrier::done`] / [`Barrier::add`] move the counter. Reaching zero
//!   completes the barrier; adding to a completed barrier reopens it.
//! - [`CondBarrier::wait`] and [`CondBarrier::wait_all`] block until the
//!   named (or all) barriers complete.
//! - [`CondBarrier::cancel`] completes everything and releases every waiter
//!   with success.
//!
//! # Errors
//! Waits fail only when a caller-supplied [`Context`] (or the parent context
//! the manager was built with) ends first. Manager cancellation is never an
//! error, even if a deadline elapsed at the same time.
//!
//! # Example Usage
//! ```
//! use condbarrier::{CondBarrier, Context, ContextError};
//! use std::thread;
//! use std::time::Duration;
//!
//! let cb = CondBarrier::new();
//! let workers: Vec<_> = (0..4)
//!     .map(|_| {
//!         let cb = cb.clone();
//!         thread::spawn(move || {
//!             let barrier = cb.create_barrier("workers");
//!             thread::sleep(Duration::from_millis(10));
//!             barrier.done();
//!         })
//!     })
//!     .collect();
//! for w in workers {
//!     w.join().unwrap();
//! }
//! cb.wait(&["workers"]).unwrap();
//!
//! let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_millis(20));
//! assert_eq!(cb.wait_context(&ctx, &["never"]), Err(ContextError::DeadlineExceeded));
//! ```

pub mod barrier;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod signal;

pub use barrier::Barrier;
pub use config::Config;
pub use context::{CancelHandle, Context};
pub use error::ContextError;
pub use manager::CondBarrier;
