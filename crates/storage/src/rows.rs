//! Persisted row shapes.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

/// One conversation, keyed by its continuation id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub turn_count: i64,
}

impl ConversationRow {
    #[must_use]
    pub fn fresh(id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            turn_count: 0,
        }
    }
}

/// One message turn, append-only within its conversation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub created_at: DateTime<Utc>,
}

/// An uploaded file, deduplicated by content hash.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRow {
    pub id: Uuid,
    pub sha256: String,
    pub size: i64,
    pub content_type: String,
    pub origin_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for a file about to be (dedup-)inserted.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub size: i64,
    pub content_type: String,
    pub origin_path: Option<String>,
}
