//! Time source abstraction
//!
//! Everything that compares against "now" (cache expiry, drain deadlines) reads
//! the time through [`Clock`] so tests can drive it by hand.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Create the production clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
