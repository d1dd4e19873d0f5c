//! Construction options for a [`CondBarrier`](crate::CondBarrier).
//!
//! # Usage Examples
//! ```
//! use condbarrier::config::Config;
//! use condbarrier::{CondBarrier, Context};
//! use std::time::Duration;
//!
//! let (parent, _cancel) = Context::with_cancel(&Context::background());
//! let config = Config::new("loader")
//!     .with_parent(parent)
//!     .with_wait_timeout(Duration::from_secs(30));
//! let cb = CondBarrier::with_config(config);
//! assert_eq!(cb.label(), "loader");
//! ```

use crate::context::Context;
use std::time::Duration;

/// Label used when none is given. It shows up in log lines and as the
/// `manager` label on every metric the crate records.
pub const DEFAULT_LABEL: &str = "cond-barrier";

#[derive(Clone, Debug)]
pub struct Config {
    pub label: String,
    /// Ending this context makes every wait report the context's error.
    /// It does not cancel the manager.
    pub parent: Option<Context>,
    /// Upper bound applied to `wait` and `wait_all`. The `*_context`
    /// variants only follow the context they are given.
    pub wait_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            parent: None,
            wait_timeout: None,
        }
    }
}

impl Config {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: Context) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.label, DEFAULT_LABEL);
        assert!(config.parent.is_none());
        assert!(config.wait_timeout.is_none());
    }

    #[test]
    fn test_builder() {
        let config = Config::new("jobs")
            .with_parent(Context::background())
            .with_wait_timeout(Duration::from_millis(5));
        assert_eq!(config.label, "jobs");
        assert!(config.parent.is_some());
        assert_eq!(config.wait_timeout, Some(Duration::from_millis(5)));
    }
}
