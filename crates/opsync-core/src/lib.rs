//! Change events, decoding and error types for opsync

pub mod decoder;
pub mod error;
pub mod event;
pub mod records;

pub use decoder::*;
pub use error::*;
pub use event::*;
pub use records::*;
