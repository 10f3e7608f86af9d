use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::{CompleteData, ErrorData, TextChunkData};
use super::types::StreamEvent;

/// Incremental decoder for the chat endpoint's server-sent events.
///
/// Events are `event: <name>` / `data: <json>` pairs separated by a blank line.
/// Bytes may split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.byte_buf.extend_from_slice(bytes);

        loop {
            let (valid_up_to, invalid_len) = match std::str::from_utf8(&self.byte_buf) {
                Ok(_) => (self.byte_buf.len(), 0),
                Err(e) => (e.valid_up_to(), e.error_len().unwrap_or(0)),
            };
            if valid_up_to > 0 {
                self.buffer
                    .push_str(&String::from_utf8_lossy(&self.byte_buf[..valid_up_to]));
            }
            if invalid_len > 0 {
                tracing::warn!("Dropping {} invalid UTF-8 bytes from SSE stream", invalid_len);
            }
            self.byte_buf.drain(..valid_up_to + invalid_len);
            // An incomplete trailing sequence waits for the next chunk.
            if invalid_len == 0 {
                break;
            }
        }
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let block = self.buffer[..event_end].to_string();
            self.buffer.drain(..event_end + 2);
            events.extend(self.decode_block(&block));
            if self.finished {
                break;
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return Vec::new();
        }
        self.decode_block(&rest)
    }

    fn decode_block(&mut self, block: &str) -> Vec<StreamEvent> {
        let mut event_type = String::new();
        let mut data = String::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event_type = name.trim().to_string();
            } else if let Some(payload) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(payload.strip_prefix(' ').unwrap_or(payload));
            }
        }

        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            self.finished = true;
            return vec![StreamEvent::Done];
        }

        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to parse SSE data for event '{}': {}", event_type, e);
                return Vec::new();
            }
        };

        match event_type.as_str() {
            "text_chunk" => match serde_json::from_value::<TextChunkData>(value) {
                Ok(data) if !data.chunk.is_empty() => vec![StreamEvent::Chunk(data.chunk)],
                _ => Vec::new(),
            },
            "complete" | "stream_complete" => {
                let complete: CompleteData = serde_json::from_value(value).unwrap_or_default();
                self.finished = true;
                match complete.topic.or(complete.title).filter(|t| !t.trim().is_empty()) {
                    Some(topic) => vec![StreamEvent::Topic(topic), StreamEvent::Done],
                    None => vec![StreamEvent::Done],
                }
            }
            "done" => {
                self.finished = true;
                vec![StreamEvent::Done]
            }
            "error" => {
                let error: ErrorData = serde_json::from_value(value).unwrap_or_default();
                self.finished = true;
                vec![StreamEvent::Error(
                    error
                        .error
                        .or(error.message)
                        .unwrap_or_else(|| "Unknown stream error".to_string()),
                )]
            }
            other => {
                let flagged = ["complete", "done", "finished"]
                    .iter()
                    .any(|k| value.get(*k).is_some_and(|v| v.as_bool().unwrap_or(!v.is_null())));
                if flagged {
                    self.finished = true;
                    vec![StreamEvent::Done]
                } else {
                    tracing::debug!("Ignoring SSE event '{}'", other);
                    Vec::new()
                }
            }
        }
    }
}

/// Decode an SSE byte stream into [`StreamEvent`]s.
///
/// A stream that ends without a terminal event still yields `Done`; the
/// caller decides whether an empty reply is an error.
pub async fn parse_sse_stream<S, E>(stream: S, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        for event in decoder.push(&bytes) {
            if tx.send(event).await.is_err() {
                return; // receiver dropped
            }
        }
        if decoder.is_finished() {
            return;
        }
    }

    for event in decoder.finish() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
    if !decoder.is_finished() {
        let _ = tx.send(StreamEvent::Done).await;
    }
}
