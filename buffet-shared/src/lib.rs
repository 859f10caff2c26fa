//! Buffet Core - Shared code for the runtime, CLI and test utilities
//!
//! This crate contains the error taxonomy and the constants every
//! buffet crate agrees on (port bases, default limits, env var names).

pub mod constants;
pub mod errors;

pub use errors::{BuffetError, BuffetResult};
