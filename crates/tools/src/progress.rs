//! Best-effort progress emission.

use {relay_protocol::ProgressLevel, serde_json::Value};

/// Sink for intermediate progress. Emission never fails and never blocks
/// the tool; a saturated transport drops frames instead.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, level: ProgressLevel, message: &str, fields: Option<Value>);

    fn info(&self, message: &str) {
        self.emit(ProgressLevel::Info, message, None);
    }

    fn debug(&self, message: &str) {
        self.emit(ProgressLevel::Debug, message, None);
    }

    fn warn(&self, message: &str) {
        self.emit(ProgressLevel::Warn, message, None);
    }
}

/// Discards everything. Used by internal calls and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _level: ProgressLevel, _message: &str, _fields: Option<Value>) {}
}
