//! Request, session, and conversation identifiers.

use uuid::Uuid;

/// Fresh UUID v4 for sessions, conversations, turns, and file refs.
#[must_use]
pub fn new_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Fresh request id, hyphenated lowercase.
#[must_use]
pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Parse a continuation id, accepting any hyphenated/simple UUID form.
pub fn parse_continuation(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(request_id(), request_id());
    }

    #[test]
    fn parse_continuation_accepts_hyphenated() {
        let id = new_uuid();
        assert_eq!(parse_continuation(&id.to_string()), Some(id));
    }

    #[test]
    fn parse_continuation_rejects_garbage() {
        assert_eq!(parse_continuation("not-a-uuid"), None);
    }
}
