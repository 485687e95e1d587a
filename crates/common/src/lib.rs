//! Shared error plumbing, id generation, and clock abstraction used across
//! all relay crates.

pub mod clock;
pub mod error;
pub mod ids;

pub use {
    clock::{Clock, SystemClock},
    error::{Error, FromMessage, RelayError, Result},
};
