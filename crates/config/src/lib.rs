//! Typed view over the daemon's environment.
//!
//! Every recognized variable has a default; parse failures fall back to the
//! default with a warning rather than aborting. [`validate`] is the fail-fast
//! gate: an inverted timeout hierarchy or a zero semaphore cap is a hard
//! error surfaced before the listener binds.

pub mod schema;
pub mod validate;

pub use {
    schema::{
        ConcurrencyLimits, FeatureFlags, ProviderEndpoint, ProviderSettings, RelayConfig,
        TimeoutHierarchy,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
