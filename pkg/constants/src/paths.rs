//! Filesystem path constants.

/// Default config file path for the `kvlock` CLI.
pub const DEFAULT_CLIENT_CONFIG: &str = "/etc/kvlock/config.yaml";
