use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attachment as carried by a message record. `content` is `None` once the
/// body has been moved to the file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub filename: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileDescriptor {
    pub fn inline(id: impl Into<String>, filename: impl Into<String>, mime_type: impl Into<String>, content: String) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            size: content.len() as u64,
            content: Some(content),
        }
    }

    pub fn is_stored_out_of_line(&self) -> bool {
        self.content.is_none()
    }
}

/// A row in the file store, keyed by `(conversation_id, file_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub conversation_id: String,
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl StoredFile {
    pub fn is_text(&self) -> bool {
        self.mime_type.starts_with("text/")
            || matches!(
                self.mime_type.as_str(),
                "application/json" | "application/javascript" | "application/xml"
            )
    }
}
