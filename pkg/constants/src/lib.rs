//! Centralized constants for the kvlock project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod lock;
pub mod paths;
pub mod session;
pub mod state;
