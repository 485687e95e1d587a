//! Pick `(provider, model)` for a tool call.
//!
//! Resolution cascade (precedence):
//! 1. Concrete requested model (exact alias match, first provider wins)
//! 2. Tool's declared preferred model
//! 3. Conversation's last-used model
//! 4. Per-provider preference lists, interleaved in configured order
//!
//! The result is a candidate *list*: the dispatcher walks it, demoting a
//! candidate for this call only when its provider fails retryably. Given
//! identical inputs and configuration the list is deterministic.

pub mod error;
pub mod resolve;

pub use {
    error::{Error, Result},
    resolve::{Candidate, RouteRequest, ToolNeeds, route},
};
