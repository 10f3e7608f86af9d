use chrono::{DateTime, Utc};
use serde::Serialize;

use super::branch::visibility;
use super::markdown::preview;
use crate::models::{Conversation, FileDescriptor, MessageKind, VersionKey};

const PREVIEW_CHARS: usize = 80;

/// What a renderer needs for one visible message, including the
/// "version n of m" navigator state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub key: VersionKey,
    pub kind: MessageKind,
    pub text: String,
    pub files: Vec<FileDescriptor>,
    /// 1-based position among the versions of this id.
    pub display_version: usize,
    pub total_versions: usize,
    pub timestamp: DateTime<Utc>,
    pub model: Option<String>,
    pub is_error: bool,
}

impl MessageView {
    pub fn has_other_versions(&self) -> bool {
        self.total_versions > 1
    }
}

/// Project the visible branch of a conversation, in display order.
pub fn project(conversation: &Conversation) -> Vec<MessageView> {
    let visible = visibility(conversation);
    visible
        .records(conversation)
        .into_iter()
        .map(|record| {
            let versions = conversation.versions_of(&record.id);
            let display_version = versions
                .iter()
                .position(|v| *v == record.version)
                .map_or(1, |p| p + 1);
            MessageView {
                key: record.key(),
                kind: record.kind,
                text: record.text.clone(),
                files: record.files.clone(),
                display_version,
                total_versions: versions.len(),
                timestamp: record.timestamp,
                model: record.model.clone(),
                is_error: record.is_error,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub visible_messages: usize,
    pub last_message_preview: Option<String>,
    /// Only metadata is kept locally.
    pub trimmed: bool,
}

pub fn summarize(conversation: &Conversation) -> ConversationSummary {
    let visible = visibility(conversation);
    let records = visible.records(conversation);
    ConversationSummary {
        id: conversation.id.clone(),
        topic: conversation.topic.clone(),
        timestamp: conversation.timestamp,
        visible_messages: records.len(),
        last_message_preview: records
            .last()
            .map(|m| preview(&m.text, PREVIEW_CHARS))
            .filter(|p| !p.is_empty()),
        trimmed: conversation.is_trimmed(),
    }
}
