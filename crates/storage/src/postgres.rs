//! Postgres statements behind the repository facade.
//!
//! Schema (managed externally, see the persisted-state layout in the docs):
//! `conversations`, `messages`, `files`, `file_providers`, `sessions`.

use {
    chrono::{DateTime, Utc},
    sqlx::PgPool,
    uuid::Uuid,
};

use crate::{
    error::Result,
    rows::{ConversationRow, FileRow, MessageRow},
};

pub(crate) async fn upsert_conversation(pool: &PgPool, row: &ConversationRow) -> Result<()> {
    sqlx::query(
        r"INSERT INTO conversations (id, created_at, updated_at, metadata, turn_count)
          VALUES ($1, $2, $3, $4, $5)
          ON CONFLICT (id) DO UPDATE
          SET updated_at = EXCLUDED.updated_at,
              metadata   = EXCLUDED.metadata,
              turn_count = EXCLUDED.turn_count",
    )
    .bind(row.id)
    .bind(row.created_at)
    .bind(row.updated_at)
    .bind(&row.metadata)
    .bind(row.turn_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn get_conversation(pool: &PgPool, id: Uuid) -> Result<Option<ConversationRow>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        r"SELECT id, created_at, updated_at, metadata, turn_count
          FROM conversations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// `ON CONFLICT (id) DO NOTHING` keeps appends idempotent by message id.
pub(crate) async fn append_message(pool: &PgPool, row: &MessageRow) -> Result<()> {
    sqlx::query(
        r"INSERT INTO messages
            (id, conversation_id, role, content, model, provider, tokens_in, tokens_out, created_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
          ON CONFLICT (id) DO NOTHING",
    )
    .bind(row.id)
    .bind(row.conversation_id)
    .bind(&row.role)
    .bind(&row.content)
    .bind(&row.model)
    .bind(&row.provider)
    .bind(row.tokens_in)
    .bind(row.tokens_out)
    .bind(row.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn recent_messages(
    pool: &PgPool,
    conversation_id: Uuid,
    limit: i64,
) -> Result<Vec<MessageRow>> {
    // Newest-first page, then restored to chronological order.
    let mut rows = sqlx::query_as::<_, MessageRow>(
        r"SELECT id, conversation_id, role, content, model, provider,
                 tokens_in, tokens_out, created_at
          FROM messages WHERE conversation_id = $1
          ORDER BY created_at DESC LIMIT $2",
    )
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.reverse();
    Ok(rows)
}

/// Insert-if-absent on the sha256 unique index, then read back whichever row
/// won. Duplicate metadata is ignored by design.
pub(crate) async fn dedup_file(pool: &PgPool, candidate: &FileRow) -> Result<FileRow> {
    sqlx::query(
        r"INSERT INTO files (id, sha256, size, content_type, origin_path, created_at)
          VALUES ($1, $2, $3, $4, $5, $6)
          ON CONFLICT (sha256) DO NOTHING",
    )
    .bind(candidate.id)
    .bind(&candidate.sha256)
    .bind(candidate.size)
    .bind(&candidate.content_type)
    .bind(&candidate.origin_path)
    .bind(candidate.created_at)
    .execute(pool)
    .await?;

    let row = sqlx::query_as::<_, FileRow>(
        r"SELECT id, sha256, size, content_type, origin_path, created_at
          FROM files WHERE sha256 = $1",
    )
    .bind(&candidate.sha256)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub(crate) async fn link_provider(
    pool: &PgPool,
    file_id: Uuid,
    provider: &str,
    external_id: &str,
) -> Result<()> {
    sqlx::query(
        r"INSERT INTO file_providers (file_id, provider, external_id)
          VALUES ($1, $2, $3)
          ON CONFLICT (file_id, provider) DO UPDATE SET external_id = EXCLUDED.external_id",
    )
    .bind(file_id)
    .bind(provider)
    .bind(external_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn touch_session(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r"INSERT INTO sessions (id, last_activity) VALUES ($1, $2)
          ON CONFLICT (id) DO UPDATE SET last_activity = EXCLUDED.last_activity",
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}
