use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct HistoryRequest {
    pub token: String,
    pub include_messages: bool,
    pub include_files: bool,
    pub include_attachments: bool,
    pub include_conversation_data: bool,
    pub include_response_metadata: bool,
    pub include_metadata: bool,
    pub detailed_responses: bool,
    pub sort_order: &'static str,
    pub excluded_conversations: Vec<String>,
    pub limit: usize,
    #[serde(rename = "specificConversationId", skip_serializing_if = "Option::is_none")]
    pub specific_conversation_id: Option<String>,
}

impl HistoryRequest {
    pub fn new(token: String, excluded_conversations: Vec<String>, limit: usize) -> Self {
        Self {
            token,
            include_messages: true,
            include_files: true,
            include_attachments: true,
            include_conversation_data: true,
            include_response_metadata: true,
            include_metadata: true,
            detailed_responses: true,
            sort_order: "desc",
            excluded_conversations,
            limit,
            specific_conversation_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserFileRequest {
    pub token: String,
    pub file_id: String,
    pub conversation_id: String,
    pub include_file_data: bool,
}

#[derive(Debug, Serialize)]
pub struct BackupSearchRequest {
    pub token: String,
    #[serde(rename = "visibleCount")]
    pub visible_count: usize,
    pub query: String,
    pub exclude_conversation_ids: Vec<String>,
}

// --- Response types ---

/// `null` and missing both become the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timestamps arrive as unix seconds, numeric strings, RFC 3339 or
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` (UTC).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Seconds(f64),
    Text(String),
}

impl WireTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Seconds(secs) => from_unix_seconds(*secs),
            WireTimestamp::Text(text) => {
                let text = text.trim();
                if let Ok(secs) = text.parse::<f64>() {
                    return from_unix_seconds(secs);
                }
                if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                    return Some(dt.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }
        }
    }
}

fn from_unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversations: Vec<RemoteConversation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConversation {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<WireTimestamp>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub memories: Vec<RemoteMemory>,
}

/// One stored exchange: a user message version and the replies it got.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMemory {
    #[serde(default)]
    pub message_id: Option<String>,
    /// Sent as a number or a numeric string.
    #[serde(default)]
    pub version: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub conversation_data: Option<ConversationData>,
}

impl RemoteMemory {
    pub fn version(&self) -> u32 {
        let parsed = match &self.version {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationData {
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<RemoteMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub model: Option<String>,
}

impl RemoteMessage {
    pub fn is_ai(&self) -> bool {
        matches!(self.role.as_str(), "assistant" | "ai")
    }
}

#[derive(Debug, Deserialize)]
pub struct UserFileResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub file_found: bool,
    #[serde(default)]
    pub file: Option<RemoteFile>,
    #[serde(default)]
    pub files: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    #[serde(default, alias = "id")]
    pub file_id: Option<String>,
    #[serde(default, alias = "original_name", alias = "name")]
    pub filename: Option<String>,
    #[serde(default, alias = "file_type", alias = "type")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, alias = "file_data")]
    pub content: Option<String>,
    /// `"base64"` when `content` is encoded.
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BackupSearchResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<BackupSearchHit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSearchHit {
    pub conversation_id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

// --- Streaming payloads ---

#[derive(Debug, Deserialize)]
pub struct TextChunkData {
    #[serde(default)]
    pub chunk: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteData {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 9, 10, 18, 15, 52).unwrap();
        let cases = [
            serde_json::json!(1757528152),
            serde_json::json!("1757528152"),
            serde_json::json!("2025-09-10T18:15:52Z"),
            serde_json::json!("2025-09-10 18:15:52"),
        ];
        for case in cases {
            let ts: WireTimestamp = serde_json::from_value(case.clone()).unwrap();
            assert_eq!(ts.to_datetime(), Some(expected), "{}", case);
        }

        let fractional: WireTimestamp =
            serde_json::from_value(serde_json::json!("2025-09-10 18:15:52.250000")).unwrap();
        assert_eq!(
            fractional.to_datetime(),
            Some(expected + chrono::Duration::milliseconds(250))
        );

        let junk: WireTimestamp = serde_json::from_value(serde_json::json!("yesterday")).unwrap();
        assert_eq!(junk.to_datetime(), None);
    }

    #[test]
    fn test_memory_version_is_lenient() {
        let memory: RemoteMemory = serde_json::from_value(serde_json::json!({
            "message_id": "msg_1",
            "version": "3",
            "conversation_data": null
        }))
        .unwrap();
        assert_eq!(memory.version(), 3);

        let memory: RemoteMemory =
            serde_json::from_value(serde_json::json!({ "message_id": "msg_1" })).unwrap();
        assert_eq!(memory.version(), 1);
    }

    #[test]
    fn test_history_request_shape() {
        let mut request = HistoryRequest::new("t".into(), vec!["conv_a".into()], 29);
        request.specific_conversation_id = Some("conv_b".into());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["limit"], 29);
        assert_eq!(json["sort_order"], "desc");
        assert_eq!(json["specificConversationId"], "conv_b");
        assert_eq!(json["excluded_conversations"][0], "conv_a");
    }
}
