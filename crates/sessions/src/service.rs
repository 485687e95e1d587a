//! The conversation service.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    tracing::{debug, warn},
    uuid::Uuid,
};

use {
    relay_common::{Clock, SystemClock},
    relay_storage::{ConversationRow, MessageRow, Repository},
};

use crate::estimator::TokenEstimator;

const APPEND_RETRIES: usize = 3;
const DEAD_LETTER_CAP: usize = 256;

/// One turn of a conversation.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: role.into(),
            content: content.into(),
            model: None,
            provider: None,
            tokens_in: 0,
            tokens_out: 0,
            created_at: Utc::now(),
        }
    }
}

/// A bounded prefix of a conversation, newest-in, oldest-out at whole-turn
/// boundaries.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub turns: Vec<Turn>,
    pub truncated: bool,
    pub estimated_tokens: usize,
}

struct CachedConversation {
    turns: Vec<Turn>,
    created_at: DateTime<Utc>,
    last_touch: Instant,
    /// (turn id, file id) associations, mirrored into row metadata.
    files: Vec<(Uuid, Uuid)>,
}

struct DeadLetter {
    conversation_id: Uuid,
    row: MessageRow,
}

/// Reconstructs history, appends turns, and associates file refs.
pub struct ConversationService {
    entries: DashMap<Uuid, CachedConversation>,
    repo: Arc<Repository>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn TokenEstimator>,
    dead_letter: Mutex<VecDeque<DeadLetter>>,
}

impl ConversationService {
    #[must_use]
    pub fn new(repo: Arc<Repository>, ttl: Duration, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self::with_clock(repo, ttl, estimator, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        repo: Arc<Repository>,
        ttl: Duration,
        estimator: Arc<dyn TokenEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            repo,
            ttl,
            clock,
            estimator,
            dead_letter: Mutex::new(VecDeque::new()),
        }
    }

    /// Start a fresh conversation and return its continuation id.
    pub async fn begin(&self) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.entries.insert(id, CachedConversation {
            turns: Vec::new(),
            created_at: now,
            last_touch: self.clock.now(),
            files: Vec::new(),
        });
        if let Err(e) = self
            .repo
            .upsert_conversation(ConversationRow::fresh(id, now))
            .await
        {
            warn!(conversation = %id, error = %e, "conversation create not persisted");
        }
        id
    }

    /// Whether a continuation id refers to a live (non-expired) conversation.
    pub async fn is_live(&self, id: Uuid) -> bool {
        if let Some(entry) = self.entries.get(&id) {
            return self.clock.now().duration_since(entry.last_touch) < self.ttl;
        }
        // Cold start: the row may exist from a previous process.
        match self.repo.get_conversation(id).await {
            Ok(Some(row)) => {
                let idle = Utc::now().signed_duration_since(row.updated_at);
                idle.to_std().map(|d| d < self.ttl).unwrap_or(true)
            },
            Ok(None) => false,
            Err(e) => {
                debug!(conversation = %id, error = %e, "liveness check degraded to cache-only");
                false
            },
        }
    }

    /// Reconstruct the most recent turns whose cumulative token estimate
    /// fits `token_budget`. Expired or unknown ids load empty; repository
    /// failures degrade to whatever the cache holds.
    pub async fn load(&self, id: Uuid, token_budget: usize) -> History {
        let turns = match self.entries.get(&id) {
            Some(entry) => {
                if self.clock.now().duration_since(entry.last_touch) >= self.ttl {
                    return History::default();
                }
                entry.turns.clone()
            },
            None => match self.hydrate(id).await {
                Some(turns) => turns,
                None => return History::default(),
            },
        };

        let mut kept = Vec::new();
        let mut total = 0usize;
        let mut truncated = false;
        for turn in turns.into_iter().rev() {
            let cost = self.estimator.estimate(&turn.content);
            if total + cost > token_budget && !kept.is_empty() {
                truncated = true;
                break;
            }
            if total + cost > token_budget {
                // A single oversized turn still loads alone.
                truncated = true;
            }
            total += cost;
            kept.push(turn);
        }
        kept.reverse();

        History {
            turns: kept,
            truncated,
            estimated_tokens: total,
        }
    }

    /// Record a turn. Idempotent by `(conversation, turn id)`; durability is
    /// best-effort with a bounded retry then dead-letter, so the call path
    /// never blocks on the repository.
    pub async fn append(&self, id: Uuid, turn: Turn) {
        let (turn_count, created_at, fresh) = {
            let mut entry = self.entries.entry(id).or_insert_with(|| CachedConversation {
                turns: Vec::new(),
                created_at: Utc::now(),
                last_touch: self.clock.now(),
                files: Vec::new(),
            });
            if entry.turns.iter().any(|t| t.id == turn.id) {
                entry.last_touch = self.clock.now();
                return;
            }
            entry.turns.push(turn.clone());
            entry.last_touch = self.clock.now();
            (entry.turns.len() as i64, entry.created_at, turn.clone())
        };

        let row = MessageRow {
            id: fresh.id,
            conversation_id: id,
            role: fresh.role,
            content: fresh.content,
            model: fresh.model,
            provider: fresh.provider,
            tokens_in: fresh.tokens_in as i64,
            tokens_out: fresh.tokens_out as i64,
            created_at: fresh.created_at,
        };
        self.persist_turn(id, row, turn_count, created_at).await;
    }

    async fn persist_turn(
        &self,
        id: Uuid,
        row: MessageRow,
        turn_count: i64,
        created_at: DateTime<Utc>,
    ) {
        let conversation = ConversationRow {
            id,
            created_at,
            updated_at: Utc::now(),
            metadata: self.metadata_for(id),
            turn_count,
        };

        for attempt in 1..=APPEND_RETRIES {
            let message = self.repo.append_message(row.clone()).await;
            let upsert = self.repo.upsert_conversation(conversation.clone()).await;
            match (message, upsert) {
                (Ok(()), Ok(())) => {
                    self.warm_recent_cache(id).await;
                    return;
                },
                (message, upsert) => {
                    let error = message.err().or(upsert.err());
                    if attempt == APPEND_RETRIES {
                        warn!(
                            conversation = %id,
                            error = ?error,
                            "append not persisted after retries, dead-lettering"
                        );
                        self.push_dead_letter(DeadLetter {
                            conversation_id: id,
                            row: row.clone(),
                        });
                        return;
                    }
                },
            }
        }
    }

    /// Best-effort warm-start entry (`conv:<id>:recent`) so a restarted
    /// process can serve the tail without a full history read.
    async fn warm_recent_cache(&self, id: Uuid) {
        let recent: Vec<serde_json::Value> = self
            .entries
            .get(&id)
            .map(|entry| {
                entry
                    .turns
                    .iter()
                    .rev()
                    .take(10)
                    .rev()
                    .map(|t| serde_json::json!({ "role": t.role, "content": t.content }))
                    .collect()
            })
            .unwrap_or_default();
        let payload = serde_json::Value::Array(recent).to_string();
        if let Err(e) = self
            .repo
            .cache()
            .set(&format!("conv:{id}:recent"), &payload, self.ttl)
            .await
        {
            debug!(conversation = %id, error = %e, "recent-turns cache write failed");
        }
    }

    fn metadata_for(&self, id: Uuid) -> serde_json::Value {
        let files: Vec<serde_json::Value> = self
            .entries
            .get(&id)
            .map(|e| {
                e.files
                    .iter()
                    .map(|(turn, file)| {
                        serde_json::json!({ "turn_id": turn, "file_id": file })
                    })
                    .collect()
            })
            .unwrap_or_default();
        serde_json::json!({ "files": files })
    }

    /// Associate an uploaded file with a turn.
    pub async fn attach_file(&self, id: Uuid, turn_id: Uuid, file_id: Uuid) {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !entry.files.contains(&(turn_id, file_id)) {
            entry.files.push((turn_id, file_id));
        }
        entry.last_touch = self.clock.now();
    }

    /// Turns currently known for a conversation (0 for unknown/expired).
    pub fn turn_count(&self, id: Uuid) -> usize {
        self.entries.get(&id).map(|e| e.turns.len()).unwrap_or(0)
    }

    /// Model that produced the most recent assistant turn, if any.
    pub fn last_used_model(&self, id: Uuid) -> Option<String> {
        self.entries
            .get(&id)?
            .turns
            .iter()
            .rev()
            .find_map(|t| t.model.clone())
    }

    /// Drop conversations idle past the TTL.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_touch) < self.ttl);
        before - self.entries.len()
    }

    /// Turns parked after persistent append failures.
    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter_lock().len()
    }

    /// Retry everything in the dead-letter buffer once.
    pub async fn drain_dead_letters(&self) {
        let parked: Vec<DeadLetter> = self.dead_letter_lock().drain(..).collect();
        for letter in parked {
            if let Err(e) = self.repo.append_message(letter.row.clone()).await {
                debug!(conversation = %letter.conversation_id, error = %e, "dead letter still failing");
                self.push_dead_letter(letter);
            }
        }
    }

    fn push_dead_letter(&self, letter: DeadLetter) {
        let mut queue = self.dead_letter_lock();
        if queue.len() >= DEAD_LETTER_CAP {
            queue.pop_front();
        }
        queue.push_back(letter);
    }

    fn dead_letter_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DeadLetter>> {
        match self.dead_letter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Warm the cache from the repository for a conversation this process
    /// has not seen. Returns `None` when unknown, expired, or unreachable.
    async fn hydrate(&self, id: Uuid) -> Option<Vec<Turn>> {
        let row = match self.repo.get_conversation(id).await {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                debug!(conversation = %id, error = %e, "hydrate degraded, loading empty");
                return None;
            },
        };

        let idle = Utc::now().signed_duration_since(row.updated_at);
        if idle.to_std().map(|d| d >= self.ttl).unwrap_or(false) {
            return None;
        }

        let messages = self.repo.recent_messages(id, 1_000).await.ok()?;
        let turns: Vec<Turn> = messages
            .into_iter()
            .map(|m| Turn {
                id: m.id,
                role: m.role,
                content: m.content,
                model: m.model,
                provider: m.provider,
                tokens_in: m.tokens_in.max(0) as u64,
                tokens_out: m.tokens_out.max(0) as u64,
                created_at: m.created_at,
            })
            .collect();

        self.entries.insert(id, CachedConversation {
            turns: turns.clone(),
            created_at: row.created_at,
            last_touch: self.clock.now(),
            files: Vec::new(),
        });
        Some(turns)
    }
}

#[cfg(test)]
mod tests {
    use relay_common::clock::test_support::ManualClock;

    use {super::*, crate::estimator::CharsPerFour};

    fn service() -> (ConversationService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let service = ConversationService::with_clock(
            Arc::new(Repository::in_memory()),
            Duration::from_secs(3 * 3600),
            Arc::new(CharsPerFour),
            clock.clone(),
        );
        (service, clock)
    }

    #[tokio::test]
    async fn append_then_load_contains_the_turn() {
        let (service, _) = service();
        let id = service.begin().await;
        service.append(id, Turn::user("hello")).await;
        let history = service.load(id, usize::MAX).await;
        assert_eq!(history.turns.len(), 1);
        assert_eq!(history.turns[0].content, "hello");
        assert!(!history.truncated);
    }

    #[tokio::test]
    async fn append_is_idempotent_by_turn_id() {
        let (service, _) = service();
        let id = service.begin().await;
        let turn = Turn::user("once");
        service.append(id, turn.clone()).await;
        service.append(id, turn).await;
        assert_eq!(service.turn_count(id), 1);
    }

    #[tokio::test]
    async fn load_respects_token_budget_at_whole_turn_boundaries() {
        let (service, _) = service();
        let id = service.begin().await;
        service.append(id, Turn::user("a".repeat(40))).await; // 10 tokens
        service.append(id, Turn::assistant("b".repeat(40))).await; // 10 tokens
        service.append(id, Turn::user("c".repeat(40))).await; // 10 tokens

        let history = service.load(id, 25).await;
        assert_eq!(history.turns.len(), 2);
        assert!(history.truncated);
        // The newest turns survive, in order.
        assert!(history.turns[0].content.starts_with('b'));
        assert!(history.turns[1].content.starts_with('c'));
    }

    #[tokio::test]
    async fn expired_conversation_loads_empty() {
        let (service, clock) = service();
        let id = service.begin().await;
        service.append(id, Turn::user("hello")).await;
        clock.advance(Duration::from_secs(3 * 3600 + 1));
        let history = service.load(id, usize::MAX).await;
        assert!(history.turns.is_empty());
        assert!(!service.is_live(id).await);
    }

    #[tokio::test]
    async fn reap_drops_only_expired_conversations() {
        let (service, clock) = service();
        let old = service.begin().await;
        service.append(old, Turn::user("old")).await;
        clock.advance(Duration::from_secs(3 * 3600 + 1));
        let fresh = service.begin().await;
        service.append(fresh, Turn::user("fresh")).await;

        assert_eq!(service.reap_expired(), 1);
        assert_eq!(service.turn_count(fresh), 1);
        assert_eq!(service.turn_count(old), 0);
    }

    #[tokio::test]
    async fn turns_load_in_created_at_order() {
        let (service, _) = service();
        let id = service.begin().await;
        for i in 0..4 {
            let mut turn = Turn::user(format!("m{i}"));
            turn.created_at = Utc::now() + chrono::Duration::seconds(i);
            service.append(id, turn).await;
        }
        let history = service.load(id, usize::MAX).await;
        let contents: Vec<_> = history.turns.iter().map(|t| t.content.clone()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn last_used_model_comes_from_latest_modelled_turn() {
        let (service, _) = service();
        let id = service.begin().await;
        service.append(id, Turn::user("q")).await;
        let mut reply = Turn::assistant("a");
        reply.model = Some("kimi-a".into());
        service.append(id, reply).await;
        assert_eq!(service.last_used_model(id), Some("kimi-a".into()));
    }
}
