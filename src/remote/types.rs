use serde::Serialize;
use thiserror::Error;

use crate::models::FileDescriptor;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Missing parameters: {0}")]
    MissingParameters(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::Network(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    /// Topic title supplied with the completion payload.
    Topic(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// One request for an AI reply on the chat endpoint.
#[derive(Clone, Serialize)]
pub struct ReplyRequest {
    pub model: String,
    pub conversation_id: String,
    /// Version of the user message being answered.
    pub version: u32,
    pub message_id: String,
    pub parent_message_id: Option<String>,
    pub message: String,
    /// JSON-encoded list of [`ContextMessage`]s.
    pub context: String,
    pub attachments: Vec<FileDescriptor>,
    pub context_plus_enabled: bool,
    pub stream: bool,
    pub token: String,
}

impl std::fmt::Debug for ReplyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyRequest")
            .field("model", &self.model)
            .field("conversation_id", &self.conversation_id)
            .field("version", &self.version)
            .field("message_id", &self.message_id)
            .field("parent_message_id", &self.parent_message_id)
            .field("message", &self.message)
            .field("attachments", &format!("[{} files]", self.attachments.len()))
            .field("context_plus_enabled", &self.context_plus_enabled)
            .field("token", &"***")
            .finish()
    }
}
