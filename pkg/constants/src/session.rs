//! Session / lease keep-alive constants.

/// Default session lease TTL in seconds.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 60;

/// Longest lease TTL granted, in seconds. Larger requests are clamped to it.
pub const MAX_LEASE_TTL_SECS: u64 = 9_000_000_000;

/// The lease is renewed every `TTL / LEASE_RENEW_INTERVAL_DIVISOR`.
pub const LEASE_RENEW_INTERVAL_DIVISOR: u32 = 3;

/// Consecutive failed renewals tolerated before the lease is declared expired.
pub const KEEPALIVE_MAX_FAILURES: u32 = 3;

// ─── Retry ────────────────────────────────────────────────────────────────

/// Attempts made for a single coordinator call before giving up as unavailable.
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay between attempts, in milliseconds.
pub const RETRY_INITIAL_BACKOFF_MS: u64 = 50;

/// Upper bound for the doubling backoff delay, in milliseconds.
pub const RETRY_MAX_BACKOFF_MS: u64 = 2_000;
