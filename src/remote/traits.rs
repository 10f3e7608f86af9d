use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{RemoteError, ReplyRequest, StreamEvent};

/// Something that can stream an AI reply. Implemented by the backend client;
/// tests substitute scripted sources.
#[async_trait]
pub trait ReplySource: Send + Sync {
    async fn stream_reply(
        &self,
        request: ReplyRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), RemoteError>;
}
