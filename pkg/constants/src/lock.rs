//! Distributed mutex constants.

/// Lock name used by the demo when none is given.
pub const DEFAULT_LOCK_NAME: &str = "mutex1";

/// Separator between a lock name and the per-session request suffix.
/// Request keys look like `<lock-name>/<lease-id-hex>`.
pub const LOCK_KEY_SEPARATOR: char = '/';

/// How long the first demo holder keeps the lock before unlocking, in seconds.
pub const DEMO_HOLD_SECS: u64 = 5;
