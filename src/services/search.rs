use chrono::{DateTime, Utc};
use serde::Serialize;

use super::branch::visibility;
use super::markdown::to_plain_text;
use super::store::HistoryStore;

const CONTEXT_BEFORE: usize = 50;
const EXCERPT_CHARS: usize = 150;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub conversation_id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    /// Window around the first match in the visible messages, or the topic.
    pub excerpt: String,
}

fn chars_eq_ci(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

fn find_ci(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].iter().zip(needle).all(|(a, b)| chars_eq_ci(*a, *b)))
}

/// Excerpt of `text` around the first case-insensitive match of `query`.
pub fn excerpt(text: &str, query: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let needle: Vec<char> = query.trim().chars().collect();
    let hit = find_ci(&chars, &needle)?;

    let start = hit.saturating_sub(CONTEXT_BEFORE);
    let end = (start + EXCERPT_CHARS).min(chars.len());
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push_str("...");
    }
    Some(out.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Case-insensitive search over topics and visible message text, newest
/// conversations first. Metadata-only conversations match on topic alone.
pub fn search(store: &HistoryStore, query: &str) -> Vec<SearchHit> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<SearchHit> = store
        .conversations()
        .values()
        .filter_map(|conversation| {
            let visible = visibility(conversation);
            let in_messages = visible
                .records(conversation)
                .into_iter()
                .find_map(|m| excerpt(&to_plain_text(&m.text), query));
            let found = in_messages.or_else(|| excerpt(&conversation.topic, query))?;
            Some(SearchHit {
                conversation_id: conversation.id.clone(),
                topic: conversation.topic.clone(),
                timestamp: conversation.timestamp,
                excerpt: found,
            })
        })
        .collect();

    hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    hits
}
