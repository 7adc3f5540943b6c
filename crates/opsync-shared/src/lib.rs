//! Shared configuration, retry and observability for opsync

pub mod config;
pub mod observability;
pub mod retry;

pub use config::*;
pub use observability::*;
pub use retry::*;
