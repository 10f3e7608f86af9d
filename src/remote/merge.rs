use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use super::models::{RemoteConversation, RemoteMemory};
use crate::models::{Conversation, MessageKind, MessageRecord, VersionKey};

const METADATA_OPEN: &str = "[METADATA]";
const METADATA_CLOSE: &str = "[/METADATA]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub conversations: usize,
    pub messages: usize,
    pub user_messages: usize,
    pub ai_messages: usize,
    pub skipped: usize,
}

/// Strip the first `[METADATA]...[/METADATA]` block and return the cleaned
/// text with the `TITLE:` value found inside it, if any.
pub fn extract_metadata(text: &str) -> (String, Option<String>) {
    let Some(start) = text.find(METADATA_OPEN) else {
        return (text.to_string(), None);
    };
    let body_start = start + METADATA_OPEN.len();
    let Some(close) = text[body_start..].find(METADATA_CLOSE) else {
        return (text.to_string(), None);
    };
    let section = &text[body_start..body_start + close];
    let end = body_start + close + METADATA_CLOSE.len();

    let cleaned = format!("{}{}", &text[..start], &text[end..]).trim().to_string();
    let title = section.lines().find_map(|line| {
        let (_, rest) = line.split_once("TITLE:")?;
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    });
    (cleaned, title)
}

/// Merge pulled conversations into `conversations`.
///
/// Conversations already present locally are left alone unless `specific`
/// names them, in which case the pulled copy replaces the local one.
pub fn merge_history(
    conversations: &mut BTreeMap<String, Conversation>,
    remote: &[RemoteConversation],
    specific: Option<&str>,
) -> MergeReport {
    let mut report = MergeReport::default();
    let now = Utc::now();

    for remote_conv in remote {
        let Some(id) = remote_conv.conversation_id.as_deref().filter(|id| !id.is_empty()) else {
            tracing::warn!("Skipping pulled conversation without an id");
            report.skipped += 1;
            continue;
        };
        let is_specific = specific == Some(id);
        if conversations.contains_key(id) && !is_specific {
            tracing::debug!("Conversation {} already present locally, skipping", id);
            report.skipped += 1;
            continue;
        }

        let Some(conversation) = convert_conversation(id, remote_conv, now) else {
            tracing::warn!("Pulled conversation {} has no memories, skipping", id);
            report.skipped += 1;
            continue;
        };

        for record in &conversation.messages {
            match record.kind {
                MessageKind::User => report.user_messages += 1,
                MessageKind::Ai => report.ai_messages += 1,
            }
        }
        report.messages += conversation.messages.len();
        report.conversations += 1;

        if is_specific && conversations.contains_key(id) {
            tracing::info!("Replacing local conversation {} with pulled copy", id);
        }
        conversations.insert(id.to_string(), conversation);
    }

    tracing::info!(
        "Merged {} conversations ({} messages: {} user, {} ai), skipped {}",
        report.conversations,
        report.messages,
        report.user_messages,
        report.ai_messages,
        report.skipped
    );
    report
}

fn group_memories(memories: &[RemoteMemory]) -> Vec<(&str, Vec<&RemoteMemory>)> {
    let mut groups: Vec<(&str, Vec<&RemoteMemory>)> = Vec::new();
    for memory in memories {
        let Some(message_id) = memory.message_id.as_deref().filter(|id| !id.is_empty()) else {
            continue;
        };
        match groups.iter_mut().find(|(id, _)| *id == message_id) {
            Some((_, group)) => group.push(memory),
            None => groups.push((message_id, vec![memory])),
        }
    }
    for (_, group) in &mut groups {
        group.sort_by_key(|m| m.version());
    }
    groups
}

fn convert_conversation(
    id: &str,
    remote: &RemoteConversation,
    now: DateTime<Utc>,
) -> Option<Conversation> {
    let groups = group_memories(&remote.memories);
    if groups.is_empty() {
        return None;
    }

    let created_at = remote.created_at.as_ref().and_then(|t| t.to_datetime());
    let mut messages: Vec<MessageRecord> = Vec::new();
    let mut seen: HashSet<VersionKey> = HashSet::new();
    let mut latest: Option<(DateTime<Utc>, &RemoteMemory)> = None;

    for (base_id, group) in &groups {
        for memory in group {
            let version = memory.version();
            let Some(data) = memory.conversation_data.as_ref() else {
                continue;
            };

            if let Some(ts) = data.timestamp.as_ref().and_then(|t| t.to_datetime()) {
                if latest.map_or(true, |(best, _)| ts > best) {
                    latest = Some((ts, *memory));
                }
            }

            let memory_ts = memory.timestamp.as_ref().and_then(|t| t.to_datetime());
            let user_parent = memory
                .parent_message_id
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(VersionKey::parse);
            let mut reply_index = 0;

            for message in &data.messages {
                let timestamp = memory_ts
                    .or_else(|| message.timestamp.as_ref().and_then(|t| t.to_datetime()))
                    .or(created_at)
                    .unwrap_or(now);
                let content = message.content.clone().unwrap_or_default();

                let record = if message.is_ai() {
                    let (text, title) = extract_metadata(&content);
                    let record = MessageRecord {
                        id: format!("{}_reply_v{}_{}", base_id, version, reply_index),
                        version: 1,
                        kind: MessageKind::Ai,
                        text,
                        files: Vec::new(),
                        timestamp,
                        parent: Some(VersionKey::new(*base_id, version)),
                        conversation_id: id.to_string(),
                        model: message.model.clone(),
                        title,
                        is_error: false,
                    };
                    reply_index += 1;
                    record
                } else {
                    MessageRecord {
                        id: base_id.to_string(),
                        version,
                        kind: MessageKind::User,
                        text: content,
                        files: Vec::new(),
                        timestamp,
                        parent: user_parent.clone(),
                        conversation_id: id.to_string(),
                        model: None,
                        title: None,
                        is_error: false,
                    }
                };

                if !seen.insert(record.key()) {
                    tracing::warn!(
                        "Duplicate {} in pulled conversation {}, skipping",
                        record.key(),
                        id
                    );
                    continue;
                }
                messages.push(record);
            }
        }
    }

    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| b.is_user().cmp(&a.is_user()))
            .then_with(|| a.version.cmp(&b.version))
    });

    let topic = latest
        .and_then(|(_, memory)| memory.title.clone())
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("Conversation {}", id));
    let timestamp = latest
        .map(|(ts, _)| ts)
        .or_else(|| messages.iter().map(|m| m.timestamp).max())
        .or(created_at)
        .unwrap_or(now);

    let mut conversation = Conversation::new(id, topic);
    conversation.timestamp = timestamp;
    conversation.messages = messages;
    Some(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::branch::visibility;
    use serde_json::json;

    fn remote(value: serde_json::Value) -> Vec<RemoteConversation> {
        serde_json::from_value(value).unwrap()
    }

    fn two_version_conversation() -> Vec<RemoteConversation> {
        remote(json!([{
            "conversation_id": "conv_1",
            "created_at": 1757500000,
            "memories": [
                {
                    "message_id": "msg_u",
                    "version": 2,
                    "timestamp": 1757500200,
                    "title": "Edited question",
                    "conversation_data": {
                        "timestamp": 1757500200,
                        "messages": [
                            { "role": "user", "content": "question v2" },
                            { "role": "assistant", "content": "answer v2[METADATA]TITLE: Ignored\nNEW_TOPIC: false[/METADATA]" }
                        ]
                    }
                },
                {
                    "message_id": "msg_u",
                    "version": "1",
                    "timestamp": "2025-09-10 10:28:20",
                    "title": "First question",
                    "conversation_data": {
                        "timestamp": 1757500100,
                        "messages": [
                            { "role": "user", "content": "question v1" },
                            { "role": "ai", "content": "answer v1" }
                        ]
                    }
                }
            ]
        }]))
    }

    #[test]
    fn test_extract_metadata() {
        let (text, title) = extract_metadata("Hello[METADATA]\nTITLE: Greeting\nNEW_TOPIC: true\n[/METADATA] ");
        assert_eq!(text, "Hello");
        assert_eq!(title.as_deref(), Some("Greeting"));

        let (text, title) = extract_metadata("no block [METADATA] unterminated");
        assert_eq!(text, "no block [METADATA] unterminated");
        assert!(title.is_none());
    }

    #[test]
    fn test_merge_builds_versioned_branches() {
        let mut conversations = BTreeMap::new();
        let report = merge_history(&mut conversations, &two_version_conversation(), None);

        assert_eq!(report.conversations, 1);
        assert_eq!(report.user_messages, 2);
        assert_eq!(report.ai_messages, 2);

        let conv = &conversations["conv_1"];
        assert_eq!(conv.topic, "Edited question");
        assert_eq!(conv.versions_of("msg_u"), vec![1, 2]);

        let reply_v2 = conv.find(&VersionKey::new("msg_u_reply_v2_0", 1)).unwrap();
        assert_eq!(reply_v2.text, "answer v2");
        assert_eq!(reply_v2.title.as_deref(), Some("Ignored"));
        assert_eq!(reply_v2.parent, Some(VersionKey::new("msg_u", 2)));

        // Latest version shows by default, with its own reply.
        let texts: Vec<&str> = visibility(conv)
            .records(conv)
            .into_iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["question v2", "answer v2"]);
    }

    #[test]
    fn test_merge_orders_by_timestamp_then_user_first() {
        let mut conversations = BTreeMap::new();
        merge_history(&mut conversations, &two_version_conversation(), None);
        let conv = &conversations["conv_1"];

        let order: Vec<(&str, u32)> = conv.messages.iter().map(|m| (m.id.as_str(), m.version)).collect();
        assert_eq!(
            order,
            vec![
                ("msg_u", 1),
                ("msg_u_reply_v1_0", 1),
                ("msg_u", 2),
                ("msg_u_reply_v2_0", 1),
            ]
        );
    }

    #[test]
    fn test_merge_skips_existing_unless_specific() {
        let mut conversations = BTreeMap::new();
        let mut local = Conversation::new("conv_1", "Local copy");
        local.messages.push(MessageRecord::user("conv_1", "local", Vec::new()));
        conversations.insert("conv_1".to_string(), local);

        let report = merge_history(&mut conversations, &two_version_conversation(), None);
        assert_eq!(report.skipped, 1);
        assert_eq!(conversations["conv_1"].topic, "Local copy");

        let report = merge_history(&mut conversations, &two_version_conversation(), Some("conv_1"));
        assert_eq!(report.conversations, 1);
        assert_eq!(conversations["conv_1"].topic, "Edited question");
    }

    #[test]
    fn test_merge_skips_missing_ids_and_empty_memories() {
        let pulled = remote(json!([
            { "memories": [{ "message_id": "m", "conversation_data": { "messages": [] } }] },
            { "conversation_id": "conv_empty", "memories": [] },
            { "conversation_id": "conv_null", "memories": null }
        ]));
        let mut conversations = BTreeMap::new();
        let report = merge_history(&mut conversations, &pulled, None);
        assert_eq!(report.skipped, 3);
        assert!(conversations.is_empty());
    }

    #[test]
    fn test_topic_falls_back_to_id() {
        let pulled = remote(json!([{
            "conversation_id": "conv_9",
            "memories": [{
                "message_id": "m1",
                "conversation_data": { "messages": [{ "role": "user", "content": "hi" }] }
            }]
        }]));
        let mut conversations = BTreeMap::new();
        merge_history(&mut conversations, &pulled, None);
        assert_eq!(conversations["conv_9"].topic, "Conversation conv_9");
    }
}
