use std::collections::BTreeMap;

use crate::models::{new_conversation_id, Conversation, FileDescriptor, MessageRecord, DEFAULT_TOPIC};
use crate::services::branch::{self, BranchError, Visibility};
use crate::services::history::{apply_retention, RetentionReport};
use crate::services::view::{summarize, ConversationSummary};

/// In-memory chat history: every conversation plus the one that is open.
///
/// Created at startup from a load, reset on sign-out or "clear history".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStore {
    conversations: BTreeMap<String, Conversation>,
    current_conversation_id: Option<String>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conversations(conversations: BTreeMap<String, Conversation>) -> Self {
        Self {
            conversations,
            current_conversation_id: None,
        }
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.current_conversation_id = None;
    }

    pub fn conversations(&self) -> &BTreeMap<String, Conversation> {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut BTreeMap<String, Conversation> {
        &mut self.conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn conversation(&self, id: &str) -> Result<&Conversation, BranchError> {
        self.conversations
            .get(id)
            .ok_or_else(|| BranchError::ConversationNotFound(id.to_string()))
    }

    pub fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation, BranchError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| BranchError::ConversationNotFound(id.to_string()))
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_conversation_id.as_deref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current_id().and_then(|id| self.conversations.get(id))
    }

    pub fn open_conversation(&mut self, id: &str) -> Result<&Conversation, BranchError> {
        if !self.conversations.contains_key(id) {
            return Err(BranchError::ConversationNotFound(id.to_string()));
        }
        self.current_conversation_id = Some(id.to_string());
        self.conversation(id)
    }

    /// Start an empty conversation and make it current.
    pub fn new_conversation(&mut self) -> String {
        let id = new_conversation_id();
        self.conversations
            .insert(id.clone(), Conversation::new(id.clone(), DEFAULT_TOPIC));
        self.current_conversation_id = Some(id.clone());
        id
    }

    /// Insert or replace a conversation wholesale (pulls, checkpoint restores).
    pub fn insert(&mut self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn delete_conversation(&mut self, id: &str) -> Option<Conversation> {
        if self.current_id() == Some(id) {
            self.current_conversation_id = None;
        }
        self.conversations.remove(id)
    }

    pub fn list_summaries(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> =
            self.conversations.values().map(summarize).collect();
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn apply_retention(&mut self) -> RetentionReport {
        let current = self.current_conversation_id.clone();
        apply_retention(&mut self.conversations, current.as_deref())
    }

    // --- Branch operations by conversation id ---

    pub fn visibility(&self, conversation_id: &str) -> Result<Visibility, BranchError> {
        Ok(branch::visibility(self.conversation(conversation_id)?))
    }

    pub fn select_version(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        version: u32,
    ) -> Result<Visibility, BranchError> {
        branch::select_version(self.conversation_mut(conversation_id)?, message_id, version)
    }

    pub fn record_edit(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        new_text: &str,
        new_files: Vec<FileDescriptor>,
    ) -> Result<(u32, MessageRecord), BranchError> {
        branch::record_edit(
            self.conversation_mut(conversation_id)?,
            message_id,
            new_text,
            new_files,
        )
    }

    pub fn attach_response(
        &mut self,
        conversation_id: &str,
        record: MessageRecord,
        parent_user_id: &str,
        parent_version: u32,
    ) -> Result<Visibility, BranchError> {
        branch::attach_response(
            self.conversation_mut(conversation_id)?,
            record,
            parent_user_id,
            parent_version,
        )
    }

    pub fn append_user_message(
        &mut self,
        conversation_id: &str,
        text: &str,
        files: Vec<FileDescriptor>,
    ) -> Result<MessageRecord, BranchError> {
        branch::append_user_message(self.conversation_mut(conversation_id)?, text, files)
    }
}

/// Truncate text to a short conversation title.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or_default().trim();
    if first_line.chars().count() > 50 {
        let cut: String = first_line.chars().take(47).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}
