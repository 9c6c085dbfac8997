pub mod config;
pub mod kv;
pub mod lease;
pub mod lock;
pub mod validate;
