//! Process-wide tunables for the collector.
//!
//! Mirrors the `OnceLock` singleton idiom used for the other process-wide
//! state in this crate (the type registry, the collector itself): a
//! `Config` is built once, optionally from the environment, and installed
//! before the first allocation touches the heap.

use std::sync::OnceLock;
use std::time::Duration;

/// Default page size in bytes. Every page allocated from the OS is this
/// size and this alignment.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default upper bound on the per-thread stack-root shadow footprint.
pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;

/// Default window (in bytes) used to decide whether a `Stack<T>` is really
/// stack-resident: the constructor compares its own address against a local
/// auto-variable's address and accepts if they lie within this many bytes.
pub const DEFAULT_MAX_STACK_OFFSET: usize = 4096;

/// Default bound on the number of distinct tracked types in one process.
pub const DEFAULT_MAX_TYPES_NUMBER: usize = 4096;

/// Default delay before a retired hazard-pointer slot may be reused.
pub const DEFAULT_ATOMIC_DELETION_DELAY_MSEC: u64 = 0;

/// Default upper bound on how long the collector sleeps between cycles.
pub const DEFAULT_MAX_SLEEP_TIME_MSEC: u64 = 200;

/// Default allocation growth (as a percentage of the live-set size at the
/// end of the last cycle) that wakes the collector early.
pub const DEFAULT_TRIGGER_PERCENTAGE: u32 = 50;

/// Compile-time-adjustable knobs for the allocator and collector.
///
/// Construct with [`Config::default`] and override individual fields, or use
/// [`Config::from_env`] to pick up `TRACEGC_*` environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Size (and alignment) of a single OS page served to the slab allocator.
    pub page_size: usize,
    /// Footprint cap for a thread's stack-root shadow region.
    pub max_stack_size: usize,
    /// Address-delta window used for stack-pointer self-detection.
    pub max_stack_offset: usize,
    /// Maximum number of distinct tracked types.
    pub max_types_number: usize,
    /// Minimum delay before a retired hazard-pointer slot is reusable.
    pub atomic_deletion_delay: Duration,
    /// Upper bound on the collector's inter-cycle sleep.
    pub max_sleep_time: Duration,
    /// Allocation growth percentage that wakes the collector early.
    pub trigger_percentage: u32,
}

impl Config {
    /// The documented default configuration.
    pub const fn default_const() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_stack_offset: DEFAULT_MAX_STACK_OFFSET,
            max_types_number: DEFAULT_MAX_TYPES_NUMBER,
            atomic_deletion_delay: Duration::from_millis(DEFAULT_ATOMIC_DELETION_DELAY_MSEC),
            max_sleep_time: Duration::from_millis(DEFAULT_MAX_SLEEP_TIME_MSEC),
            trigger_percentage: DEFAULT_TRIGGER_PERCENTAGE,
        }
    }

    /// Builds a `Config` from `TRACEGC_*` environment variables, falling
    /// back to [`Config::default_const`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default_const();
        if let Some(v) = env_usize("TRACEGC_PAGE_SIZE") {
            cfg.page_size = v;
        }
        if let Some(v) = env_usize("TRACEGC_MAX_STACK_SIZE") {
            cfg.max_stack_size = v;
        }
        if let Some(v) = env_usize("TRACEGC_MAX_STACK_OFFSET") {
            cfg.max_stack_offset = v;
        }
        if let Some(v) = env_usize("TRACEGC_MAX_TYPES_NUMBER") {
            cfg.max_types_number = v;
        }
        if let Some(v) = env_u64("TRACEGC_ATOMIC_DELETION_DELAY_MSEC") {
            cfg.atomic_deletion_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("TRACEGC_MAX_SLEEP_TIME_MSEC") {
            cfg.max_sleep_time = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("TRACEGC_TRIGGER_PERCENTAGE") {
            cfg.trigger_percentage = v as u32;
        }
        cfg
    }

    /// `object_size` above which a type must use the large-object page
    /// variant (one page, one slot) instead of a shared slab.
    pub const fn page_data_size(&self) -> usize {
        // Conservative: reserve one word for the page's back-pointer header.
        self.page_size - std::mem::size_of::<usize>()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_const()
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Returns the process-wide configuration, installing [`Config::from_env`]
/// on first access if nobody called [`install_config`] first.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Installs a `Config` before the first allocation.
///
/// Returns `false` (and leaves the existing configuration in place) if the
/// configuration was already installed or implicitly initialized — slab
/// geometry is derived from `page_size` at first touch, so changing it
/// afterward would desynchronize live pages from the new geometry.
pub fn install_config(cfg: Config) -> bool {
    CONFIG.set(cfg).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_const_matches_documented_values() {
        let cfg = Config::default_const();
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.max_types_number, 4096);
        assert_eq!(cfg.trigger_percentage, 50);
    }

    #[test]
    fn page_data_size_reserves_header_word() {
        let cfg = Config::default_const();
        assert_eq!(cfg.page_data_size(), 4096 - std::mem::size_of::<usize>());
    }
}
