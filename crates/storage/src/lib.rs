//! Typed gateway to the persistence backends.
//!
//! The repository fronts an optional Postgres pool and an optional Redis
//! connection. Both are best-effort: the in-memory mirror is authoritative
//! for reads, writers write through, and a backend failure degrades rather
//! than breaking the call path. No method panics.

pub mod cache;
pub mod error;
mod memory;
mod postgres;
pub mod repository;
pub mod rows;

pub use {
    cache::Cache,
    error::{Error, Result},
    repository::Repository,
    rows::{ConversationRow, FileRow, MessageRow, NewFile},
};
