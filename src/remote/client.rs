use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use super::models::{
    BackupSearchHit, BackupSearchRequest, BackupSearchResponse, HistoryRequest, HistoryResponse,
    RemoteConversation, RemoteFile, UserFileRequest, UserFileResponse,
};
use super::stream::parse_sse_stream;
use super::traits::ReplySource;
use super::types::{RemoteError, ReplyRequest, StreamEvent};
use crate::config::API_PATH;

const ERROR_BODY_LIMIT: usize = 200;

/// HTTP client for the chat backend's single `index.php?endpoint=...` API.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    api_url: Url,
}

impl BackendClient {
    pub fn new(backend_url: &str) -> Result<Self, RemoteError> {
        let base = format!("{}/", backend_url.trim_end_matches('/'));
        let api_url = Url::parse(&base)
            .and_then(|u| u.join(API_PATH))
            .map_err(|e| {
                RemoteError::MissingParameters(format!("Invalid backend URL '{}': {}", backend_url, e))
            })?;
        Ok(Self {
            client: Client::new(),
            api_url,
        })
    }

    pub fn endpoint_url(&self, endpoint: &str) -> Url {
        let mut url = self.api_url.clone();
        url.query_pairs_mut().append_pair("endpoint", endpoint);
        url
    }

    fn post<B: Serialize + ?Sized>(&self, endpoint: &str, token: &str, body: &B) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint_url(endpoint))
            .header("Authorization", format!("Bearer {}", token))
            .json(body)
    }

    async fn post_json<B, T>(&self, endpoint: &str, token: &str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .post(endpoint, token, body)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to reach backend: {}", e)))?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let value = classify_response(status, &text)?;

        serde_json::from_value(value).map_err(|e| {
            RemoteError::MalformedResponse(format!("Unexpected {} payload: {}", endpoint, e))
        })
    }

    /// Pull conversations the client does not have yet.
    pub async fn fetch_history(
        &self,
        token: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<RemoteConversation>, RemoteError> {
        if token.is_empty() {
            return Err(RemoteError::NotAuthenticated);
        }
        let response: HistoryResponse = self.post_json("chat_history", token, request).await?;
        if !response.success {
            tracing::warn!("chat_history response did not report success");
        }
        tracing::info!(
            "Fetched {} conversations from backend",
            response.conversations.len()
        );
        Ok(response.conversations)
    }

    pub async fn fetch_user_file(
        &self,
        token: &str,
        conversation_id: &str,
        file_id: &str,
    ) -> Result<RemoteFile, RemoteError> {
        if token.is_empty() {
            return Err(RemoteError::NotAuthenticated);
        }
        if conversation_id.is_empty() || file_id.is_empty() {
            return Err(RemoteError::MissingParameters(
                "file_id and conversation_id are required".to_string(),
            ));
        }

        let request = UserFileRequest {
            token: token.to_string(),
            file_id: file_id.to_string(),
            conversation_id: conversation_id.to_string(),
            include_file_data: true,
        };
        let response: UserFileResponse = self.post_json("user_files", token, &request).await?;

        match response {
            UserFileResponse {
                success: true,
                file_found: true,
                file: Some(file),
                ..
            } => Ok(file),
            UserFileResponse {
                success: true,
                files: Some(files),
                message,
                ..
            } if !files.is_empty() => Err(RemoteError::MalformedResponse(
                message.unwrap_or_else(|| format!("Expected one file, got {}", files.len())),
            )),
            UserFileResponse { message, .. } => Err(RemoteError::NotFound(
                message.unwrap_or_else(|| format!("File {} not found", file_id)),
            )),
        }
    }

    pub async fn backup_search(
        &self,
        token: &str,
        query: &str,
        visible_count: usize,
        exclude_conversation_ids: Vec<String>,
    ) -> Result<Vec<BackupSearchHit>, RemoteError> {
        if token.is_empty() {
            return Err(RemoteError::NotAuthenticated);
        }
        let request = BackupSearchRequest {
            token: token.to_string(),
            visible_count,
            query: query.to_string(),
            exclude_conversation_ids,
        };
        let response: BackupSearchResponse = self
            .post_json("conversations_backup_search", token, &request)
            .await?;
        Ok(response.results)
    }
}

#[async_trait]
impl ReplySource for BackendClient {
    async fn stream_reply(
        &self,
        request: ReplyRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), RemoteError> {
        if request.token.is_empty() {
            return Err(RemoteError::NotAuthenticated);
        }

        let response = self
            .post("chat", &request.token, &request)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to reach backend: {}", e)))?;

        let status = response.status().as_u16();
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

        if !(200..300).contains(&status) || !is_event_stream {
            let text = response.text().await.unwrap_or_default();
            classify_response(status, &text)?;
            return Err(RemoteError::InvalidResponse(
                "Expected an event stream from the chat endpoint".to_string(),
            ));
        }

        parse_sse_stream(response.bytes_stream(), tx).await;
        Ok(())
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_LIMIT {
        body.to_string()
    } else {
        let cut: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        format!("{}...", cut)
    }
}

fn looks_like_error_page(body: &str) -> bool {
    body.trim_start().starts_with('<')
        || ["<br />", "<b>", "Error:", "Exception:"]
            .iter()
            .any(|marker| body.contains(marker))
}

/// Shared classification of backend responses.
///
/// A non-2xx status is an [`RemoteError::Http`], a body that is not JSON is an
/// [`RemoteError::InvalidResponse`], and `success: false` under a 2xx status
/// is a [`RemoteError::ServerError`].
pub fn classify_response(status: u16, body: &str) -> Result<serde_json::Value, RemoteError> {
    if !(200..300).contains(&status) {
        return Err(RemoteError::Http {
            status,
            body: truncate_body(body),
        });
    }

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) if looks_like_error_page(body) => {
            return Err(RemoteError::InvalidResponse(format!(
                "Server returned an error page: {}",
                truncate_body(body)
            )));
        }
        Err(_) => return Err(RemoteError::InvalidResponse(truncate_body(body))),
    };

    if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let message = value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| truncate_body(&value.to_string()));
        return Err(RemoteError::ServerError(message));
    }

    Ok(value)
}
