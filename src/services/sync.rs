use chrono::Utc;

use super::store::HistoryStore;
use crate::config::FALLBACK_THRESHOLD;
use crate::models::{AuthState, Conversation};
use crate::remote::models::HistoryRequest;
use crate::remote::{merge_history, BackendClient, MergeReport, RemoteError};

/// Pulls backend history when the local store is thin. Nothing local changes
/// until the backend has answered successfully.
pub struct SyncService;

impl SyncService {
    pub fn needs_fallback(store: &HistoryStore, auth: &AuthState) -> bool {
        auth.is_authenticated() && store.len() < FALLBACK_THRESHOLD
    }

    /// Pull conversations missing locally, or re-pull `specific` and replace
    /// the local copy.
    pub async fn pull_history(
        store: &mut HistoryStore,
        auth: &AuthState,
        client: &BackendClient,
        specific: Option<&str>,
    ) -> Result<MergeReport, RemoteError> {
        let token = auth.bearer().ok_or(RemoteError::NotAuthenticated)?;

        let request = match specific {
            Some(id) => HistoryRequest {
                specific_conversation_id: Some(id.to_string()),
                ..HistoryRequest::new(token.to_string(), Vec::new(), 1)
            },
            None => {
                let excluded: Vec<String> = store.conversations().keys().cloned().collect();
                let limit = FALLBACK_THRESHOLD.saturating_sub(excluded.len()).max(1);
                HistoryRequest::new(token.to_string(), excluded, limit)
            }
        };

        let remote = client.fetch_history(token, &request).await?;
        Ok(merge_history(store.conversations_mut(), &remote, specific))
    }

    /// Add backup search hits that are not local yet as metadata-only
    /// conversations. Their messages arrive with a later specific pull.
    pub async fn pull_backup_search(
        store: &mut HistoryStore,
        auth: &AuthState,
        client: &BackendClient,
        query: &str,
        visible_count: usize,
    ) -> Result<usize, RemoteError> {
        let token = auth.bearer().ok_or(RemoteError::NotAuthenticated)?;
        let exclude: Vec<String> = store.conversations().keys().cloned().collect();

        let hits = client.backup_search(token, query, visible_count, exclude).await?;

        let mut added = 0;
        for hit in hits {
            if hit.conversation_id.is_empty() || store.get(&hit.conversation_id).is_some() {
                continue;
            }
            let topic = hit
                .topic
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Conversation {}", hit.conversation_id));
            let mut conversation = Conversation::new(hit.conversation_id.clone(), topic);
            conversation.timestamp = hit
                .timestamp
                .as_ref()
                .and_then(|t| t.to_datetime())
                .unwrap_or_else(Utc::now);
            store.insert(conversation);
            added += 1;
        }

        tracing::info!("Backup search for {:?} added {} conversations", query, added);
        Ok(added)
    }
}
