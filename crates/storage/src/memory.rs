//! In-process mirror of the persisted state.
//!
//! Always written first; reads come from here so a Postgres outage degrades
//! to whatever this process has seen.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use {
    chrono::{DateTime, Utc},
    uuid::Uuid,
};

use crate::rows::{ConversationRow, FileRow, MessageRow};

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, ConversationRow>,
    messages: HashMap<Uuid, Vec<MessageRow>>,
    files_by_sha: HashMap<String, Uuid>,
    files: HashMap<Uuid, FileRow>,
    provider_links: HashMap<(Uuid, String), String>,
    sessions: HashMap<Uuid, DateTime<Utc>>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned mutex only happens after a panic in this module; the
        // data is plain maps, so continuing with it is safe.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn upsert_conversation(&self, row: ConversationRow) {
        self.lock().conversations.insert(row.id, row);
    }

    pub fn get_conversation(&self, id: Uuid) -> Option<ConversationRow> {
        self.lock().conversations.get(&id).cloned()
    }

    /// Append-only; a message id already present is left untouched.
    pub fn append_message(&self, row: MessageRow) -> bool {
        let mut state = self.lock();
        let turns = state.messages.entry(row.conversation_id).or_default();
        if turns.iter().any(|m| m.id == row.id) {
            return false;
        }
        turns.push(row);
        turns.sort_by_key(|m| m.created_at);
        true
    }

    pub fn recent_messages(&self, conversation_id: Uuid, limit: usize) -> Vec<MessageRow> {
        let state = self.lock();
        let Some(turns) = state.messages.get(&conversation_id) else {
            return Vec::new();
        };
        let start = turns.len().saturating_sub(limit);
        turns[start..].to_vec()
    }

    /// Returns the existing row on a sha256 hit, otherwise stores and
    /// returns the candidate.
    pub fn dedup_file(&self, candidate: FileRow) -> FileRow {
        let mut state = self.lock();
        if let Some(existing_id) = state.files_by_sha.get(&candidate.sha256)
            && let Some(existing) = state.files.get(existing_id)
        {
            return existing.clone();
        }
        state
            .files_by_sha
            .insert(candidate.sha256.clone(), candidate.id);
        state.files.insert(candidate.id, candidate.clone());
        candidate
    }

    pub fn get_file(&self, id: Uuid) -> Option<FileRow> {
        self.lock().files.get(&id).cloned()
    }

    pub fn link_provider(&self, file_id: Uuid, provider: &str, external_id: &str) {
        self.lock()
            .provider_links
            .insert((file_id, provider.to_string()), external_id.to_string());
    }

    pub fn provider_link(&self, file_id: Uuid, provider: &str) -> Option<String> {
        self.lock()
            .provider_links
            .get(&(file_id, provider.to_string()))
            .cloned()
    }

    pub fn touch_session(&self, id: Uuid, at: DateTime<Utc>) {
        self.lock().sessions.insert(id, at);
    }
}
