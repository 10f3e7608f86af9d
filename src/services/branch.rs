use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use thiserror::Error;

use crate::models::{Conversation, FileDescriptor, MessageKind, MessageRecord, VersionKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BranchError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Version not found: {0}")]
    VersionNotFound(VersionKey),

    #[error("Message {0} is not a user message")]
    NotUserMessage(String),

    #[error("Message text is empty")]
    EmptyText,

    #[error("Duplicate message version: {0}")]
    DuplicateVersion(VersionKey),

    #[error("Version {found} of {message_id} would leave a gap (next is {expected})")]
    VersionGap {
        message_id: String,
        expected: u32,
        found: u32,
    },
}

/// The set of records shown for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visibility {
    visible: HashSet<VersionKey>,
}

impl Visibility {
    pub fn is_visible(&self, key: &VersionKey) -> bool {
        self.visible.contains(key)
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &VersionKey> {
        self.visible.iter()
    }

    /// Visible records in chronological (list) order.
    pub fn records<'a>(&self, conversation: &'a Conversation) -> Vec<&'a MessageRecord> {
        conversation
            .messages
            .iter()
            .filter(|m| self.visible.contains(&m.key()))
            .collect()
    }
}

/// Compute which records are visible.
///
/// A record is visible when its version is the displayed version of its id
/// and its parent is absent or itself visible. Records whose parent does not
/// exist are skipped with a warning.
pub fn visibility(conversation: &Conversation) -> Visibility {
    let index: HashMap<VersionKey, &MessageRecord> = conversation
        .messages
        .iter()
        .map(|m| (m.key(), m))
        .collect();

    let mut displayed: HashMap<&str, u32> = HashMap::new();
    for record in &conversation.messages {
        if !displayed.contains_key(record.id.as_str()) {
            if let Some(v) = conversation.displayed_version(&record.id) {
                displayed.insert(record.id.as_str(), v);
            }
        }
    }

    let mut memo: HashMap<VersionKey, bool> = HashMap::new();
    for record in &conversation.messages {
        resolve(&record.key(), &index, &displayed, &mut memo, &conversation.id);
    }

    Visibility {
        visible: memo
            .into_iter()
            .filter_map(|(key, visible)| visible.then_some(key))
            .collect(),
    }
}

fn resolve(
    start: &VersionKey,
    index: &HashMap<VersionKey, &MessageRecord>,
    displayed: &HashMap<&str, u32>,
    memo: &mut HashMap<VersionKey, bool>,
    conversation_id: &str,
) -> bool {
    if let Some(&known) = memo.get(start) {
        return known;
    }

    // Walk up to a resolved ancestor, a root, or a broken link.
    let mut chain: Vec<VersionKey> = Vec::new();
    let mut on_chain: HashSet<VersionKey> = HashSet::new();
    let mut cursor = Some(start.clone());
    let mut parent_visible = true;

    while let Some(key) = cursor {
        if let Some(&known) = memo.get(&key) {
            parent_visible = known;
            break;
        }
        if !on_chain.insert(key.clone()) {
            tracing::warn!("Parent cycle at {} in conversation {}", key, conversation_id);
            parent_visible = false;
            break;
        }
        match index.get(&key) {
            Some(record) => {
                chain.push(key);
                cursor = record.parent.clone();
            }
            None => {
                tracing::warn!(
                    "Dangling parent {} in conversation {}, skipping branch",
                    key,
                    conversation_id
                );
                parent_visible = false;
                break;
            }
        }
    }

    for key in chain.into_iter().rev() {
        let own = displayed.get(key.message_id.as_str()) == Some(&key.version);
        let visible = parent_visible && own;
        memo.insert(key, visible);
        parent_visible = visible;
    }

    memo.get(start).copied().unwrap_or(false)
}

/// Show version `target_version` of `message_id` and the latest branch below it.
///
/// Walks breadth-first from `message_id.v{target_version}`: children of every
/// frontier key are grouped by id and only the highest version of each id is
/// kept. Every chosen version becomes the displayed version of its id.
pub fn select_version(
    conversation: &mut Conversation,
    message_id: &str,
    target_version: u32,
) -> Result<Visibility, BranchError> {
    let root = VersionKey::new(message_id, target_version);
    if !conversation.contains(&root) {
        tracing::warn!(
            "Version {} not found in conversation {}",
            root,
            conversation.id
        );
        return Err(BranchError::VersionNotFound(root));
    }

    show_ancestors(conversation, &root);

    let mut chosen: Vec<(String, u32)> = vec![(message_id.to_string(), target_version)];
    let mut chosen_ids: HashSet<String> = HashSet::from([message_id.to_string()]);
    let mut frontier: VecDeque<VersionKey> = VecDeque::from([root]);

    while let Some(parent_key) = frontier.pop_front() {
        let mut latest: Vec<&MessageRecord> = Vec::new();
        for record in conversation
            .messages
            .iter()
            .filter(|m| m.parent.as_ref() == Some(&parent_key))
        {
            match latest.iter_mut().find(|r| r.id == record.id) {
                Some(current) if record.version > current.version => *current = record,
                Some(_) => {}
                None => latest.push(record),
            }
        }

        for record in latest {
            if chosen_ids.insert(record.id.clone()) {
                chosen.push((record.id.clone(), record.version));
                frontier.push_back(record.key());
            }
        }
    }

    for (id, version) in chosen {
        conversation.displayed_versions.insert(id, version);
    }

    Ok(visibility(conversation))
}

/// Point the displayed version of every ancestor of `key` at the version on
/// its path, so `key` itself can be visible. Stops at a missing parent or a
/// cycle.
fn show_ancestors(conversation: &mut Conversation, key: &VersionKey) {
    let mut path: Vec<VersionKey> = Vec::new();
    let mut seen: HashSet<VersionKey> = HashSet::from([key.clone()]);
    let mut cursor = conversation.find(key).and_then(|r| r.parent.clone());

    while let Some(parent) = cursor {
        if !seen.insert(parent.clone()) {
            tracing::warn!("Parent cycle at {} in conversation {}", parent, conversation.id);
            break;
        }
        let Some(record) = conversation.find(&parent) else {
            break;
        };
        cursor = record.parent.clone();
        path.push(parent);
    }

    for ancestor in path {
        conversation
            .displayed_versions
            .insert(ancestor.message_id, ancestor.version);
    }
}

fn validate_text(text: &str, files: &[FileDescriptor]) -> Result<(), BranchError> {
    if text.trim().is_empty() && files.is_empty() {
        return Err(BranchError::EmptyText);
    }
    Ok(())
}

/// Append a new version of a user message. The old versions stay untouched;
/// the branch that followed the previously displayed version is hidden.
pub fn record_edit(
    conversation: &mut Conversation,
    message_id: &str,
    new_text: &str,
    new_files: Vec<FileDescriptor>,
) -> Result<(u32, MessageRecord), BranchError> {
    let displayed = conversation
        .displayed_version(message_id)
        .ok_or_else(|| BranchError::MessageNotFound(message_id.to_string()))?;
    let current = conversation
        .find(&VersionKey::new(message_id, displayed))
        .ok_or_else(|| BranchError::MessageNotFound(message_id.to_string()))?;

    if current.kind != MessageKind::User {
        return Err(BranchError::NotUserMessage(message_id.to_string()));
    }
    validate_text(new_text, &new_files)?;

    let new_version = conversation.max_version(message_id).unwrap_or(0) + 1;
    let record = MessageRecord {
        id: message_id.to_string(),
        version: new_version,
        kind: MessageKind::User,
        text: new_text.to_string(),
        files: new_files,
        timestamp: Utc::now(),
        parent: current.parent.clone(),
        conversation_id: conversation.id.clone(),
        model: None,
        title: None,
        is_error: false,
    };

    conversation.messages.push(record.clone());
    conversation
        .displayed_versions
        .insert(message_id.to_string(), new_version);
    show_ancestors(conversation, &record.key());
    conversation.touch(record.timestamp);

    tracing::debug!(
        "Recorded {} in conversation {}",
        record.key(),
        conversation.id
    );
    Ok((new_version, record))
}

/// Attach a reply to the user message version it answers.
///
/// The reply becomes visible right away when that version is on the visible
/// branch, otherwise it stays hidden until that branch is selected.
pub fn attach_response(
    conversation: &mut Conversation,
    mut record: MessageRecord,
    parent_user_id: &str,
    parent_version: u32,
) -> Result<Visibility, BranchError> {
    let parent = VersionKey::new(parent_user_id, parent_version);
    record.parent = Some(parent.clone());
    record.conversation_id = conversation.id.clone();

    let key = record.key();
    if conversation.contains(&key) {
        tracing::warn!("Duplicate {} in conversation {}", key, conversation.id);
        return Err(BranchError::DuplicateVersion(key));
    }
    let expected = conversation.max_version(&record.id).unwrap_or(0) + 1;
    if record.version != expected {
        return Err(BranchError::VersionGap {
            message_id: record.id,
            expected,
            found: key.version,
        });
    }
    if !conversation.contains(&parent) {
        tracing::warn!(
            "Reply {} points at missing parent {} in conversation {}",
            key,
            parent,
            conversation.id
        );
    }

    let parent_visible = visibility(conversation).is_visible(&parent);
    let timestamp = record.timestamp;
    conversation.messages.push(record);
    if parent_visible {
        conversation
            .displayed_versions
            .insert(key.message_id.clone(), key.version);
    }
    conversation.touch(timestamp);

    Ok(visibility(conversation))
}

/// Append a fresh user message after the last visible user message.
pub fn append_user_message(
    conversation: &mut Conversation,
    text: &str,
    files: Vec<FileDescriptor>,
) -> Result<MessageRecord, BranchError> {
    validate_text(text, &files)?;

    let visible = visibility(conversation);
    let parent = visible
        .records(conversation)
        .into_iter()
        .rev()
        .find(|m| m.is_user())
        .map(|m| m.key());

    let mut record = MessageRecord::user(&conversation.id, text, files);
    record.parent = parent;

    conversation.messages.push(record.clone());
    conversation
        .displayed_versions
        .insert(record.id.clone(), record.version);
    conversation.touch(record.timestamp);

    Ok(record)
}

pub fn next_version(conversation: &Conversation, message_id: &str) -> u32 {
    conversation.max_version(message_id).unwrap_or(0) + 1
}

/// The user message version a reply to `message_id` should answer: the
/// message itself for a user message, its parent for an AI message.
pub fn reply_parent(conversation: &Conversation, message_id: &str) -> Result<VersionKey, BranchError> {
    let version = conversation
        .displayed_version(message_id)
        .ok_or_else(|| BranchError::MessageNotFound(message_id.to_string()))?;
    let record = conversation
        .find(&VersionKey::new(message_id, version))
        .ok_or_else(|| BranchError::MessageNotFound(message_id.to_string()))?;

    match record.kind {
        MessageKind::User => Ok(record.key()),
        MessageKind::Ai => record
            .parent
            .clone()
            .ok_or_else(|| BranchError::MessageNotFound(format!("parent of {}", message_id))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    DuplicateVersion(VersionKey),
    VersionGap { message_id: String, missing: u32 },
    DanglingParent { key: VersionKey, parent: VersionKey },
}

/// Diagnostics for records that break the history invariants. Never fails.
pub fn check_consistency(conversation: &Conversation) -> Vec<Inconsistency> {
    let mut issues = Vec::new();
    let mut seen: HashSet<VersionKey> = HashSet::new();
    let mut versions: HashMap<&str, Vec<u32>> = HashMap::new();

    for record in &conversation.messages {
        let key = record.key();
        if !seen.insert(key.clone()) {
            issues.push(Inconsistency::DuplicateVersion(key));
        }
        versions.entry(record.id.as_str()).or_default().push(record.version);
    }

    let mut ids: Vec<&str> = versions.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let present: HashSet<u32> = versions[id].iter().copied().collect();
        let max = present.iter().copied().max().unwrap_or(0);
        for v in 1..=max {
            if !present.contains(&v) {
                issues.push(Inconsistency::VersionGap {
                    message_id: id.to_string(),
                    missing: v,
                });
            }
        }
    }

    for record in &conversation.messages {
        if let Some(parent) = &record.parent {
            if !seen.contains(parent) {
                issues.push(Inconsistency::DanglingParent {
                    key: record.key(),
                    parent: parent.clone(),
                });
            }
        }
    }

    issues
}
