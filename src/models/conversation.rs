use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{short_suffix, MessageRecord, VersionKey};

pub const DEFAULT_TOPIC: &str = "New conversation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub topic: String,
    /// Last activity.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    /// Currently displayed version per message id. Absent ids show their highest version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub displayed_versions: BTreeMap<String, u32>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            timestamp: Utc::now(),
            messages: Vec::new(),
            displayed_versions: BTreeMap::new(),
        }
    }

    pub fn find(&self, key: &VersionKey) -> Option<&MessageRecord> {
        self.messages
            .iter()
            .find(|m| m.id == key.message_id && m.version == key.version)
    }

    pub fn contains(&self, key: &VersionKey) -> bool {
        self.find(key).is_some()
    }

    pub fn max_version(&self, message_id: &str) -> Option<u32> {
        self.messages
            .iter()
            .filter(|m| m.id == message_id)
            .map(|m| m.version)
            .max()
    }

    /// Versions recorded for `message_id`, ascending.
    pub fn versions_of(&self, message_id: &str) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .messages
            .iter()
            .filter(|m| m.id == message_id)
            .map(|m| m.version)
            .collect();
        versions.sort_unstable();
        versions
    }

    /// The version shown for `message_id`: the stored choice if that version
    /// exists, otherwise the highest one.
    pub fn displayed_version(&self, message_id: &str) -> Option<u32> {
        let max = self.max_version(message_id)?;
        match self.displayed_versions.get(message_id) {
            Some(&v) if self.contains(&VersionKey::new(message_id, v)) => Some(v),
            _ => Some(max),
        }
    }

    pub fn is_trimmed(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.timestamp {
            self.timestamp = at;
        }
    }
}

/// Generate a conversation id in the `conv_{millis}_{suffix}` shape.
pub fn new_conversation_id() -> String {
    format!("conv_{}_{}", Utc::now().timestamp_millis(), short_suffix())
}
