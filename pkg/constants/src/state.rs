//! State store / coordinator constants.

/// How often the in-process coordinator sweeps for lapsed leases, in milliseconds.
pub const LEASE_REAPER_INTERVAL_MS: u64 = 100;

/// Capacity of the broadcast channel feeding watch streams.
/// A watcher that falls further behind than this is told to resync.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

