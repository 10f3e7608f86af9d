use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};

use super::database::Database;
use super::store::HistoryStore;
use crate::config::{storage_keys, CONVERSATION_LIMIT, FULL_HISTORY_LIMIT};
use crate::models::Conversation;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Conversations removed entirely.
    pub evicted: Vec<String>,
    /// Conversations reduced to metadata.
    pub trimmed: Vec<String>,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.trimmed.is_empty()
    }
}

/// Enforce the local retention limits.
///
/// The most recent conversations keep their messages, the rest keep only
/// metadata, and beyond the hard cap the oldest are dropped. The current
/// conversation is never evicted or trimmed; when it is not among the most
/// recent it takes the last full slot.
pub fn apply_retention(
    conversations: &mut BTreeMap<String, Conversation>,
    current: Option<&str>,
) -> RetentionReport {
    let mut report = RetentionReport::default();

    let mut ordered: Vec<(chrono::DateTime<chrono::Utc>, String)> = conversations
        .values()
        .map(|c| (c.timestamp, c.id.clone()))
        .collect();
    ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    while ordered.len() > CONVERSATION_LIMIT {
        let Some(pos) = ordered
            .iter()
            .rposition(|(_, id)| Some(id.as_str()) != current)
        else {
            break;
        };
        let (_, id) = ordered.remove(pos);
        conversations.remove(&id);
        report.evicted.push(id);
    }

    let mut full: Vec<&str> = ordered
        .iter()
        .take(FULL_HISTORY_LIMIT)
        .map(|(_, id)| id.as_str())
        .collect();
    if let Some(current) = current.filter(|c| conversations.contains_key(*c)) {
        if !full.contains(&current) {
            if full.len() == FULL_HISTORY_LIMIT {
                full.pop();
            }
            full.push(current);
        }
    }
    let full: HashSet<&str> = full.into_iter().collect();

    for (_, id) in &ordered {
        if full.contains(id.as_str()) {
            continue;
        }
        if let Some(conversation) = conversations.get_mut(id) {
            if !conversation.messages.is_empty() {
                conversation.messages.clear();
                conversation.displayed_versions.clear();
                report.trimmed.push(id.clone());
            }
        }
    }

    if !report.is_empty() {
        tracing::info!(
            "Retention evicted {} and trimmed {} conversations",
            report.evicted.len(),
            report.trimmed.len()
        );
    }
    report
}

/// Persists the conversation map under the chat-history key.
pub struct HistoryService;

impl HistoryService {
    /// Write the whole history in one transaction. A failed write leaves the
    /// previous value in place.
    pub async fn save(db: &Database, store: &HistoryStore) -> Result<()> {
        let json = serde_json::to_string(store.conversations())
            .context("Failed to serialize chat history")?;
        db.set_value(storage_keys::CHAT_HISTORY, &json)
            .await
            .context("Failed to save chat history")
    }

    pub async fn save_with_retention(db: &Database, store: &mut HistoryStore) -> Result<RetentionReport> {
        let report = store.apply_retention();
        Self::save(db, store).await?;
        Ok(report)
    }

    /// Read the saved history. Missing, unreadable or corrupt data yields an
    /// empty store.
    pub async fn load(db: &Database) -> HistoryStore {
        let json = match db.get_value(storage_keys::CHAT_HISTORY).await {
            Ok(Some(json)) => json,
            Ok(None) => return HistoryStore::new(),
            Err(e) => {
                tracing::warn!("Failed to read chat history: {}", e);
                return HistoryStore::new();
            }
        };

        match serde_json::from_str::<BTreeMap<String, Conversation>>(&json) {
            Ok(conversations) => {
                tracing::debug!("Loaded {} conversations", conversations.len());
                HistoryStore::from_conversations(conversations)
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable chat history: {}", e);
                HistoryStore::new()
            }
        }
    }

    pub async fn clear(db: &Database, store: &mut HistoryStore) -> Result<()> {
        store.clear();
        db.remove_values(&[storage_keys::CHAT_HISTORY])
            .await
            .context("Failed to clear chat history")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileDescriptor, MessageRecord};
    use crate::services::branch;
    use chrono::{Duration, Utc};

    fn conversation_at(id: &str, minutes_ago: i64) -> Conversation {
        let mut conv = Conversation::new(id, format!("Topic {}", id));
        branch::append_user_message(&mut conv, "hello", Vec::new()).unwrap();
        conv.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        conv
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_with_versions_and_files() {
        let db = Database::new_in_memory().unwrap();
        let mut store = HistoryStore::new();
        let id = store.new_conversation();

        let file = FileDescriptor::inline("file_1", "notes.md", "text/markdown", "# notes".into());
        let user = store.append_user_message(&id, "question", vec![file]).unwrap();
        store
            .attach_response(&id, MessageRecord::ai(&id, "answer", Some("deepseek-r1".into())), &user.id, 1)
            .unwrap();
        store.record_edit(&id, &user.id, "better question", Vec::new()).unwrap();
        store.select_version(&id, &user.id, 1).unwrap();

        HistoryService::save(&db, &store).await.unwrap();
        let loaded = HistoryService::load(&db).await;

        assert_eq!(loaded.conversations(), store.conversations());
        let conv = loaded.get(&id).unwrap();
        assert_eq!(conv.versions_of(&user.id), vec![1, 2]);
        assert_eq!(conv.displayed_version(&user.id), Some(1));
        assert_eq!(conv.messages[0].files[0].content.as_deref(), Some("# notes"));
    }

    #[tokio::test]
    async fn test_load_missing_or_corrupt_is_empty() {
        let db = Database::new_in_memory().unwrap();
        assert!(HistoryService::load(&db).await.is_empty());

        db.set_value(storage_keys::CHAT_HISTORY, "{not json").await.unwrap();
        assert!(HistoryService::load(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_saved_history() {
        let db = Database::new_in_memory().unwrap();
        let mut store = HistoryStore::new();
        store.new_conversation();
        HistoryService::save(&db, &store).await.unwrap();

        HistoryService::clear(&db, &mut store).await.unwrap();
        assert!(store.is_empty());
        assert!(HistoryService::load(&db).await.is_empty());
    }

    #[test]
    fn test_retention_limits_with_current() {
        let mut conversations = BTreeMap::new();
        for i in 0..105 {
            let conv = conversation_at(&format!("conv_{:03}", i), i);
            conversations.insert(conv.id.clone(), conv);
        }
        let current = conversation_at("conv_current", 10_000);
        conversations.insert(current.id.clone(), current);

        let report = apply_retention(&mut conversations, Some("conv_current"));

        assert_eq!(conversations.len(), CONVERSATION_LIMIT);
        assert_eq!(report.evicted.len(), 6);
        assert!(conversations.contains_key("conv_current"));
        assert!(!conversations["conv_current"].messages.is_empty());

        let full = conversations.values().filter(|c| !c.messages.is_empty()).count();
        assert_eq!(full, FULL_HISTORY_LIMIT);
        // The 30th most recent gave its slot to the current conversation.
        assert!(conversations["conv_029"].messages.is_empty());
        assert!(!conversations["conv_028"].messages.is_empty());
        assert!(!conversations.contains_key("conv_104"));
    }

    #[test]
    fn test_retention_under_limits_is_noop() {
        let mut conversations = BTreeMap::new();
        for i in 0..10 {
            let conv = conversation_at(&format!("c{}", i), i);
            conversations.insert(conv.id.clone(), conv);
        }
        let before = conversations.clone();
        let report = apply_retention(&mut conversations, None);
        assert!(report.is_empty());
        assert_eq!(conversations, before);
    }

    #[tokio::test]
    async fn test_save_with_retention_persists_trimmed_state() {
        let db = Database::new_in_memory().unwrap();
        let mut store = HistoryStore::new();
        for i in 0..35 {
            store.insert(conversation_at(&format!("conv_{:02}", i), i));
        }

        let report = HistoryService::save_with_retention(&db, &mut store).await.unwrap();
        assert_eq!(report.trimmed.len(), 5);

        let loaded = HistoryService::load(&db).await;
        assert_eq!(loaded.len(), 35);
        assert!(loaded.get("conv_34").unwrap().is_trimmed());
        assert!(!loaded.get("conv_00").unwrap().is_trimmed());
    }
}
