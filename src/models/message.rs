use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::file::FileDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    #[serde(alias = "assistant")]
    Ai,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::Ai => "ai",
        }
    }

    /// Wire role name used when a message is sent back as model context.
    pub fn role(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::Ai => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageKind::User),
            "ai" | "assistant" => Some(MessageKind::Ai),
            _ => None,
        }
    }
}

/// One version of one logical message: `{message_id}.v{version}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct VersionKey {
    pub message_id: String,
    pub version: u32,
}

impl VersionKey {
    pub fn new(message_id: impl Into<String>, version: u32) -> Self {
        Self {
            message_id: message_id.into(),
            version,
        }
    }

    /// Parses `"{id}.v{n}"`. Strings without a valid suffix are treated as
    /// version 1 of the whole string.
    pub fn parse(s: &str) -> Self {
        if let Some(idx) = s.rfind(".v") {
            let (id, suffix) = (&s[..idx], &s[idx + 2..]);
            if !id.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(version) = suffix.parse::<u32>() {
                    if version >= 1 {
                        return Self::new(id, version);
                    }
                }
            }
        }
        Self::new(s, 1)
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.v{}", self.message_id, self.version)
    }
}

impl From<VersionKey> for String {
    fn from(key: VersionKey) -> Self {
        key.to_string()
    }
}

impl From<String> for VersionKey {
    fn from(s: String) -> Self {
        VersionKey::parse(&s)
    }
}

fn first_version() -> u32 {
    1
}

/// An immutable message record. Editing appends a new record with the same
/// `id` and the next `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: String,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "parent_message_id", default)]
    pub parent: Option<VersionKey>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Error bubbles ("please sign in", usage limits) are shown but never sent as context.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl MessageRecord {
    pub fn user(conversation_id: &str, text: impl Into<String>, files: Vec<FileDescriptor>) -> Self {
        Self {
            id: new_message_id(),
            version: 1,
            kind: MessageKind::User,
            text: text.into(),
            files,
            timestamp: Utc::now(),
            parent: None,
            conversation_id: conversation_id.to_string(),
            model: None,
            title: None,
            is_error: false,
        }
    }

    pub fn ai(conversation_id: &str, text: impl Into<String>, model: Option<String>) -> Self {
        Self {
            id: new_message_id(),
            version: 1,
            kind: MessageKind::Ai,
            text: text.into(),
            files: Vec::new(),
            timestamp: Utc::now(),
            parent: None,
            conversation_id: conversation_id.to_string(),
            model,
            title: None,
            is_error: false,
        }
    }

    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.id.clone(), self.version)
    }

    pub fn is_user(&self) -> bool {
        self.kind == MessageKind::User
    }
}

/// Generate a new message id in the `msg_{millis}_{suffix}` shape the backend expects.
pub fn new_message_id() -> String {
    format!("msg_{}_{}", Utc::now().timestamp_millis(), short_suffix())
}

pub(crate) fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..9].to_string()
}
