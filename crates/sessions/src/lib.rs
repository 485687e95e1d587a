//! Conversation state: continuation ids, ordered turn history, and the
//! bounded-prefix reconstruction handed to tools.
//!
//! The in-memory map is authoritative for reads; the repository is
//! write-through best-effort. A conversation idle past its TTL reads as
//! empty and the caller starts fresh.

pub mod error;
pub mod estimator;
pub mod service;

pub use {
    error::{Error, Result},
    estimator::{CharsPerFour, TokenEstimator},
    service::{ConversationService, History, Turn},
};
