//! Runtime tunables.
//!
//! Everything here has a sensible default; a guest overrides fields before
//! handing the config to [`crate::Runtime::start`].

use klog::LevelFilter;

pub use khal::grant::{NR_GRANT_FRAMES, NR_RESERVED_ENTRIES, PAGE_SIZE};
pub use khal::shared_info::NR_EVENT_CHANNELS;
pub use khal::store::{XENSTORE_PAYLOAD_MAX, XENSTORE_RING_SIZE};

/// Configuration of the runtime core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Preemption tick in nanoseconds.
    pub timer_period_ns: u64,
    /// Grant-table frames to request from the hypervisor (at most
    /// [`NR_GRANT_FRAMES`]).
    pub grant_frames: usize,
    /// Preferred grant-table version. Falls back to 1 if refused.
    pub grant_version: u32,
    /// Yield the vCPU while waiting on the xenstore ring instead of spinning.
    pub store_yield_while_waiting: bool,
    /// Give up on a stalled xenstore ring after this many waits.
    /// `None` waits forever.
    pub store_spin_limit: Option<u32>,
    /// Console log level.
    pub log_level: LevelFilter,
}

impl RuntimeConfig {
    pub const DEFAULT: RuntimeConfig = RuntimeConfig {
        timer_period_ns: 1_000_000,
        grant_frames: NR_GRANT_FRAMES,
        grant_version: 2,
        store_yield_while_waiting: true,
        store_spin_limit: None,
        log_level: LevelFilter::Info,
    };
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
