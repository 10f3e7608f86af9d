use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;

use super::database::Database;
use crate::config::LARGE_CONTENT_THRESHOLD;
use crate::models::{Conversation, FileDescriptor, StoredFile};
use crate::remote::{BackendClient, RemoteError};

/// Attachment bodies kept outside the history blob, keyed by
/// `(conversation_id, file_id)`.
#[derive(Debug, Clone)]
pub struct FileStore {
    db: Database,
}

impl FileStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn put(&self, file: &StoredFile) -> Result<()> {
        self.db
            .upsert_file(file)
            .await
            .with_context(|| format!("Failed to store file {}", file.file_id))
    }

    pub async fn get(&self, conversation_id: &str, file_id: &str) -> Result<Option<StoredFile>> {
        self.db.get_file(conversation_id, file_id).await
    }

    pub async fn list(&self, conversation_id: &str) -> Result<Vec<StoredFile>> {
        self.db.list_files(conversation_id).await
    }

    /// Move inline file content above the size threshold into the store.
    /// Returns how many attachments were moved.
    pub async fn offload(&self, conversation: &mut Conversation) -> Result<usize> {
        let mut moved = 0;
        for record in &mut conversation.messages {
            for descriptor in &mut record.files {
                let Some(content) = descriptor
                    .content
                    .as_ref()
                    .filter(|c| c.len() > LARGE_CONTENT_THRESHOLD)
                else {
                    continue;
                };
                let stored = stored_from_descriptor(&conversation.id, descriptor, content.as_bytes().to_vec());
                self.put(&stored).await?;
                descriptor.content = None;
                moved += 1;
            }
        }
        if moved > 0 {
            tracing::debug!(
                "Moved {} attachments of conversation {} to the file store",
                moved,
                conversation.id
            );
        }
        Ok(moved)
    }

    /// Local copy first, then the backend; a remote hit is cached locally.
    pub async fn fetch(
        &self,
        conversation_id: &str,
        file_id: &str,
        client: &BackendClient,
        token: Option<&str>,
    ) -> Result<StoredFile> {
        if let Some(file) = self.get(conversation_id, file_id).await? {
            return Ok(file);
        }

        let token = token.ok_or(RemoteError::NotAuthenticated)?;
        let remote = client.fetch_user_file(token, conversation_id, file_id).await?;

        let raw = remote.content.clone().unwrap_or_default();
        let data = match remote.encoding.as_deref() {
            Some("base64") => base64::engine::general_purpose::STANDARD
                .decode(raw.trim())
                .map_err(|e| RemoteError::MalformedResponse(format!("Invalid base64 file data: {}", e)))?,
            _ => raw.into_bytes(),
        };

        let file = StoredFile {
            conversation_id: conversation_id.to_string(),
            file_id: file_id.to_string(),
            filename: remote.filename.clone().unwrap_or_else(|| file_id.to_string()),
            mime_type: remote
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: remote.size.unwrap_or(data.len() as u64),
            data,
            created_at: Utc::now(),
        };
        self.put(&file).await?;
        tracing::info!("Cached remote file {} for conversation {}", file_id, conversation_id);
        Ok(file)
    }

    pub async fn delete_conversation_files(&self, conversation_id: &str) -> Result<usize> {
        self.db.delete_files(conversation_id).await
    }
}

fn stored_from_descriptor(conversation_id: &str, descriptor: &FileDescriptor, data: Vec<u8>) -> StoredFile {
    StoredFile {
        conversation_id: conversation_id.to_string(),
        file_id: descriptor.id.clone(),
        filename: descriptor.filename.clone(),
        mime_type: descriptor.mime_type.clone(),
        size: data.len() as u64,
        data,
        created_at: Utc::now(),
    }
}
