//! The repository facade.
//!
//! Writers apply to the in-memory mirror first, then write through to
//! Postgres when a pool is configured. Readers consult the mirror and fall
//! back to Postgres on a miss. A returned `Err` always means the persistent
//! backend failed after the mirror was updated; callers choose how far to
//! degrade.

use std::sync::Arc;

use {
    chrono::{DateTime, Utc},
    sqlx::{PgPool, postgres::PgPoolOptions},
    tracing::warn,
    uuid::Uuid,
};

use crate::{
    cache::Cache,
    error::Result,
    memory::MemoryStore,
    postgres,
    rows::{ConversationRow, FileRow, MessageRow, NewFile},
};

pub struct Repository {
    pg: Option<PgPool>,
    mem: MemoryStore,
    cache: Arc<Cache>,
}

impl Repository {
    /// Purely in-memory repository (tests, no `DATABASE_URL`).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            pg: None,
            mem: MemoryStore::default(),
            cache: Arc::new(Cache::in_memory()),
        }
    }

    /// Connect to the configured backends. Connection failures degrade to
    /// in-memory with a warning; they are not fatal.
    pub async fn connect(database_url: Option<&str>, redis_url: Option<&str>) -> Self {
        let pg = match database_url {
            None => None,
            Some(url) => match PgPoolOptions::new().max_connections(8).connect(url).await {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "postgres unavailable, repository degrades to in-memory");
                    None
                },
            },
        };

        Self {
            pg,
            mem: MemoryStore::default(),
            cache: Arc::new(Cache::connect(redis_url).await),
        }
    }

    #[must_use]
    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.cache)
    }

    #[must_use]
    pub fn persistent(&self) -> bool {
        self.pg.is_some()
    }

    // ── Conversations ────────────────────────────────────────────────────

    pub async fn upsert_conversation(&self, row: ConversationRow) -> Result<()> {
        self.mem.upsert_conversation(row.clone());
        if let Some(pool) = &self.pg {
            postgres::upsert_conversation(pool, &row).await?;
        }
        Ok(())
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Option<ConversationRow>> {
        if let Some(row) = self.mem.get_conversation(id) {
            return Ok(Some(row));
        }
        let Some(pool) = &self.pg else {
            return Ok(None);
        };
        let row = postgres::get_conversation(pool, id).await?;
        if let Some(ref found) = row {
            self.mem.upsert_conversation(found.clone());
        }
        Ok(row)
    }

    // ── Messages ─────────────────────────────────────────────────────────

    /// Idempotent by message id at both layers.
    pub async fn append_message(&self, row: MessageRow) -> Result<()> {
        self.mem.append_message(row.clone());
        if let Some(pool) = &self.pg {
            postgres::append_message(pool, &row).await?;
        }
        Ok(())
    }

    /// The most recent `limit` turns in created-at order.
    pub async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let cached = self.mem.recent_messages(conversation_id, limit);
        if !cached.is_empty() {
            return Ok(cached);
        }
        let Some(pool) = &self.pg else {
            return Ok(Vec::new());
        };
        let rows = postgres::recent_messages(pool, conversation_id, limit as i64).await?;
        for row in &rows {
            self.mem.append_message(row.clone());
        }
        Ok(rows)
    }

    // ── Files ────────────────────────────────────────────────────────────

    /// Dedup-upsert by sha256: the first writer wins and later metadata is
    /// ignored, so both calls observe the same row.
    pub async fn dedup_file(&self, sha256: &str, meta: NewFile) -> Result<FileRow> {
        let candidate = FileRow {
            id: Uuid::new_v4(),
            sha256: sha256.to_string(),
            size: meta.size,
            content_type: meta.content_type,
            origin_path: meta.origin_path,
            created_at: Utc::now(),
        };

        if let Some(pool) = &self.pg {
            let row = postgres::dedup_file(pool, &candidate).await?;
            self.mem.dedup_file(row.clone());
            return Ok(row);
        }
        Ok(self.mem.dedup_file(candidate))
    }

    pub async fn get_file(&self, id: Uuid) -> Result<Option<FileRow>> {
        Ok(self.mem.get_file(id))
    }

    pub async fn link_provider_file(
        &self,
        file_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<()> {
        self.mem.link_provider(file_id, provider, external_id);
        if let Some(pool) = &self.pg {
            postgres::link_provider(pool, file_id, provider, external_id).await?;
        }
        Ok(())
    }

    pub async fn provider_file_id(&self, file_id: Uuid, provider: &str) -> Result<Option<String>> {
        Ok(self.mem.provider_link(file_id, provider))
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Optional persistence; a no-op without Postgres.
    pub async fn touch_session(&self, id: Uuid, last_activity: DateTime<Utc>) -> Result<()> {
        self.mem.touch_session(id, last_activity);
        if let Some(pool) = &self.pg {
            postgres::touch_session(pool, id, last_activity).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_file() -> NewFile {
        NewFile {
            size: 42,
            content_type: "text/plain".into(),
            origin_path: Some("/tmp/a.txt".into()),
        }
    }

    #[tokio::test]
    async fn dedup_file_returns_same_row_for_same_sha() {
        let repo = Repository::in_memory();
        let first = repo.dedup_file("abc123", new_file()).await.unwrap();
        let second = repo
            .dedup_file("abc123", NewFile {
                size: 999,
                content_type: "application/json".into(),
                origin_path: None,
            })
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        // Second call's metadata is ignored.
        assert_eq!(second.size, 42);
        assert_eq!(second.content_type, "text/plain");
    }

    #[tokio::test]
    async fn append_is_idempotent_by_message_id() {
        let repo = Repository::in_memory();
        let conv = Uuid::new_v4();
        let row = MessageRow {
            id: Uuid::new_v4(),
            conversation_id: conv,
            role: "user".into(),
            content: "hello".into(),
            model: None,
            provider: None,
            tokens_in: 1,
            tokens_out: 0,
            created_at: Utc::now(),
        };
        repo.append_message(row.clone()).await.unwrap();
        repo.append_message(row).await.unwrap();
        assert_eq!(repo.recent_messages(conv, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_messages_are_in_created_at_order() {
        let repo = Repository::in_memory();
        let conv = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..5 {
            repo.append_message(MessageRow {
                id: Uuid::new_v4(),
                conversation_id: conv,
                role: "user".into(),
                content: format!("m{i}"),
                model: None,
                provider: None,
                tokens_in: 0,
                tokens_out: 0,
                created_at: base + chrono::Duration::seconds(i),
            })
            .await
            .unwrap();
        }
        let recent = repo.recent_messages(conv, 3).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn provider_links_survive_relinking() {
        let repo = Repository::in_memory();
        let file = repo.dedup_file("sha", new_file()).await.unwrap();
        repo.link_provider_file(file.id, "kimi", "ext-1")
            .await
            .unwrap();
        repo.link_provider_file(file.id, "kimi", "ext-2")
            .await
            .unwrap();
        assert_eq!(
            repo.provider_file_id(file.id, "kimi").await.unwrap(),
            Some("ext-2".to_string())
        );
        assert_eq!(repo.provider_file_id(file.id, "glm").await.unwrap(), None);
    }
}
