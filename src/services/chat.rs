use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::branch::{self, BranchError};
use super::context::build_context;
use super::settings::AppSettings;
use super::store::{truncate_title, HistoryStore};
use crate::config::MAX_CONTEXT_MESSAGES;
use crate::models::{
    new_message_id, AuthState, Conversation, FileDescriptor, MessageKind, MessageRecord, VersionKey,
    DEFAULT_TOPIC,
};
use crate::remote::{RemoteError, ReplyRequest, ReplySource, StreamEvent};

pub const SIGN_IN_NOTICE: &str = "Please sign in to continue.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("A request is already in flight")]
    Busy,

    #[error("Reply belongs to a request that is no longer current")]
    Stale,

    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Identifies one send; replies carrying an old token are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(Uuid);

#[derive(Debug)]
struct InFlight {
    token: RequestToken,
    cancel: CancellationToken,
    conversation_id: String,
}

/// Tracks the single request allowed in flight. Clones share state, so one
/// handle can cancel a send that another is awaiting.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    inner: Arc<Mutex<Option<InFlight>>>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin(&self, conversation_id: &str) -> Result<(RequestToken, CancellationToken), ChatError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(ChatError::Busy);
        }
        let token = RequestToken(Uuid::new_v4());
        let cancel = CancellationToken::new();
        *slot = Some(InFlight {
            token,
            cancel: cancel.clone(),
            conversation_id: conversation_id.to_string(),
        });
        Ok((token, cancel))
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }

    pub fn in_flight_conversation(&self) -> Option<String> {
        self.slot().as_ref().map(|f| f.conversation_id.clone())
    }

    pub fn is_current(&self, token: RequestToken) -> bool {
        self.slot().as_ref().is_some_and(|f| f.token == token)
    }

    /// Cancel the in-flight request. Its sender restores the conversation.
    pub fn cancel(&self) -> bool {
        match self.slot().as_ref() {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Abandon the in-flight request (conversation switch, sign-out). Its
    /// reply, if one still arrives, is stale.
    pub fn reset(&self) {
        if let Some(in_flight) = self.slot().take() {
            in_flight.cancel.cancel();
            tracing::debug!(
                "Abandoned request for conversation {}",
                in_flight.conversation_id
            );
        }
    }

    pub fn complete(&self, token: RequestToken) -> Result<(), ChatError> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(in_flight) if in_flight.token == token => {
                *slot = None;
                Ok(())
            }
            _ => Err(ChatError::Stale),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    /// The user message version that was answered.
    pub user: MessageRecord,
    pub reply: MessageRecord,
    pub topic: Option<String>,
}

#[derive(Debug, Default)]
struct CollectedReply {
    text: String,
    topic: Option<String>,
}

/// Sends messages, edits and regenerations and folds the streamed replies
/// into the history.
pub struct ChatService {
    session: ChatSession,
    source: Arc<dyn ReplySource>,
    settings: AppSettings,
    auth: AuthState,
}

impl ChatService {
    pub fn new(session: ChatSession, source: Arc<dyn ReplySource>, settings: AppSettings, auth: AuthState) -> Self {
        Self {
            session,
            source,
            settings,
            auth,
        }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    fn token(&self) -> Result<String, ChatError> {
        self.auth
            .bearer()
            .map(str::to_string)
            .ok_or(ChatError::Remote(RemoteError::NotAuthenticated))
    }

    pub async fn send_message(
        &self,
        store: &mut HistoryStore,
        conversation_id: &str,
        text: &str,
        files: Vec<FileDescriptor>,
    ) -> Result<ChatOutcome, ChatError> {
        let Ok(token) = self.token() else {
            record_sign_in_notice(store, conversation_id, text, files)?;
            return Err(RemoteError::NotAuthenticated.into());
        };
        let checkpoint = store.conversation(conversation_id)?.clone();
        let (request_token, cancel) = self.session.begin(conversation_id)?;

        let conversation = match store.conversation_mut(conversation_id) {
            Ok(c) => c,
            Err(e) => return self.abort(store, checkpoint, request_token, e.into()),
        };
        let starts_conversation = conversation.messages.is_empty();
        let user = match branch::append_user_message(conversation, text, files) {
            Ok(user) => user,
            Err(e) => return self.abort(store, checkpoint, request_token, e.into()),
        };
        if starts_conversation && conversation.topic == DEFAULT_TOPIC {
            conversation.topic = truncate_title(text);
        }

        self.exchange(store, checkpoint, request_token, cancel, token, user, None)
            .await
    }

    /// Record a new version of a user message and ask for a reply to it.
    pub async fn resend_edit(
        &self,
        store: &mut HistoryStore,
        conversation_id: &str,
        message_id: &str,
        text: &str,
        files: Vec<FileDescriptor>,
    ) -> Result<ChatOutcome, ChatError> {
        let token = self.token()?;
        let checkpoint = store.conversation(conversation_id)?.clone();
        let (request_token, cancel) = self.session.begin(conversation_id)?;

        let user = match store.record_edit(conversation_id, message_id, text, files) {
            Ok((_, record)) => record,
            Err(e) => return self.abort(store, checkpoint, request_token, e.into()),
        };

        self.exchange(store, checkpoint, request_token, cancel, token, user, None)
            .await
    }

    /// Ask again for the reply to the user message `message_id` answers (or
    /// is). An AI message gets a new version of itself.
    pub async fn regenerate(
        &self,
        store: &mut HistoryStore,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<ChatOutcome, ChatError> {
        let token = self.token()?;
        let checkpoint = store.conversation(conversation_id)?.clone();

        let parent = branch::reply_parent(&checkpoint, message_id)?;
        let user = checkpoint
            .find(&parent)
            .cloned()
            .ok_or_else(|| BranchError::VersionNotFound(parent.clone()))?;
        let reply_key = match checkpoint
            .displayed_version(message_id)
            .and_then(|v| checkpoint.find(&VersionKey::new(message_id, v)))
        {
            Some(record) if record.kind == MessageKind::Ai => VersionKey::new(
                message_id,
                branch::next_version(&checkpoint, message_id),
            ),
            _ => VersionKey::new(new_message_id(), 1),
        };

        let (request_token, cancel) = self.session.begin(conversation_id)?;
        self.exchange(store, checkpoint, request_token, cancel, token, user, Some(reply_key))
            .await
    }

    pub fn cancel(&self) -> bool {
        self.session.cancel()
    }

    fn abort(
        &self,
        store: &mut HistoryStore,
        checkpoint: Conversation,
        request_token: RequestToken,
        error: ChatError,
    ) -> Result<ChatOutcome, ChatError> {
        store.insert(checkpoint);
        let _ = self.session.complete(request_token);
        Err(error)
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        store: &mut HistoryStore,
        checkpoint: Conversation,
        request_token: RequestToken,
        cancel: CancellationToken,
        token: String,
        user: MessageRecord,
        reply_key: Option<VersionKey>,
    ) -> Result<ChatOutcome, ChatError> {
        let conversation_id = checkpoint.id.clone();
        let request = match store.conversation(&conversation_id) {
            Ok(conversation) => self.build_request(conversation, &user, token),
            Err(e) => return self.abort(store, checkpoint, request_token, e.into()),
        };

        tracing::info!(
            "Requesting reply to {} in conversation {}",
            user.key(),
            conversation_id
        );
        let result = collect_reply(self.source.clone(), request, cancel).await;

        if !self.session.is_current(request_token) {
            tracing::warn!(
                "Dropping reply to {} in conversation {}: request is no longer current",
                user.key(),
                conversation_id
            );
            return Err(ChatError::Stale);
        }

        let collected = match result {
            Ok(collected) => collected,
            Err(e) => {
                tracing::warn!("Reply to {} failed: {}", user.key(), e);
                return self.abort(store, checkpoint, request_token, e);
            }
        };

        let mut reply = MessageRecord::ai(
            &conversation_id,
            collected.text,
            Some(self.settings.selected_model.clone()),
        );
        if let Some(key) = reply_key {
            reply.id = key.message_id;
            reply.version = key.version;
        }

        if let Err(e) = store.attach_response(&conversation_id, reply.clone(), &user.id, user.version) {
            return self.abort(store, checkpoint, request_token, e.into());
        }
        if let Some(topic) = &collected.topic {
            if let Ok(conversation) = store.conversation_mut(&conversation_id) {
                conversation.topic = topic.clone();
            }
        }
        self.session.complete(request_token)?;

        reply.parent = Some(user.key());
        Ok(ChatOutcome {
            user,
            reply,
            topic: collected.topic,
        })
    }

    fn build_request(&self, conversation: &Conversation, user: &MessageRecord, token: String) -> ReplyRequest {
        let context = build_context(conversation, Some(&user.key()), MAX_CONTEXT_MESSAGES);
        let context = serde_json::to_string(&context).unwrap_or_else(|e| {
            tracing::warn!("Failed to encode context: {}", e);
            "[]".to_string()
        });

        ReplyRequest {
            model: self.settings.selected_model.clone(),
            conversation_id: conversation.id.clone(),
            version: user.version,
            message_id: user.id.clone(),
            parent_message_id: user.parent.as_ref().map(|p| p.to_string()),
            message: user.text.clone(),
            context,
            attachments: user.files.clone(),
            context_plus_enabled: self.settings.context_plus_enabled,
            stream: true,
            token,
        }
    }
}

/// Keep the unsent message and answer it with an error bubble asking the
/// user to sign in. Error bubbles never go back out as model context.
fn record_sign_in_notice(
    store: &mut HistoryStore,
    conversation_id: &str,
    text: &str,
    files: Vec<FileDescriptor>,
) -> Result<(), ChatError> {
    let conversation = store.conversation_mut(conversation_id)?;
    let user = branch::append_user_message(conversation, text, files)?;
    let mut notice = MessageRecord::ai(conversation_id, SIGN_IN_NOTICE, None);
    notice.is_error = true;
    branch::attach_response(conversation, notice, &user.id, user.version)?;
    tracing::info!("Message in conversation {} not sent: not signed in", conversation_id);
    Ok(())
}

async fn collect_reply(
    source: Arc<dyn ReplySource>,
    request: ReplyRequest,
    cancel_token: CancellationToken,
) -> Result<CollectedReply, ChatError> {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
    let mut stream_handle = tokio::spawn(async move { source.stream_reply(request, tx).await });

    let mut collected = CollectedReply::default();
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                stream_handle.abort();
                return Err(ChatError::Cancelled);
            }
            event = rx.recv() => {
                match event {
                    Some(StreamEvent::Chunk(chunk)) => collected.text.push_str(&chunk),
                    Some(StreamEvent::Topic(topic)) => collected.topic = Some(topic),
                    Some(StreamEvent::Done) => break,
                    Some(StreamEvent::Error(error)) => {
                        stream_handle.abort();
                        return Err(RemoteError::ServerError(error).into());
                    }
                    None => {
                        // Sender gone: surface the source's own error if it had one.
                        match (&mut stream_handle).await {
                            Ok(Ok(())) => break,
                            Ok(Err(e)) => return Err(e.into()),
                            Err(e) => return Err(RemoteError::Network(e.to_string()).into()),
                        }
                    }
                }
            }
        }
    }

    if collected.text.trim().is_empty() {
        return Err(RemoteError::InvalidResponse("Empty reply".to_string()).into());
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthUser;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Replies with a fixed script of events, optionally hanging afterwards.
    struct ScriptedSource {
        events: Vec<StreamEvent>,
        hang: bool,
        started: Arc<Notify>,
        requests: Mutex<Vec<ReplyRequest>>,
    }

    impl ScriptedSource {
        fn new(events: Vec<StreamEvent>) -> Self {
            Self {
                events,
                hang: false,
                started: Arc::new(Notify::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn hanging(events: Vec<StreamEvent>) -> Self {
            Self {
                hang: true,
                ..Self::new(events)
            }
        }
    }

    #[async_trait]
    impl ReplySource for ScriptedSource {
        async fn stream_reply(
            &self,
            request: ReplyRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), RemoteError> {
            self.requests.lock().unwrap().push(request);
            self.started.notify_one();
            for event in &self.events {
                let _ = tx.send(event.clone()).await;
            }
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ReplySource for FailingSource {
        async fn stream_reply(
            &self,
            _request: ReplyRequest,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), RemoteError> {
            Err(RemoteError::Http {
                status: 502,
                body: "bad gateway".into(),
            })
        }
    }

    fn signed_in() -> AuthState {
        AuthState {
            token: Some("tok".into()),
            user: Some(AuthUser {
                id: None,
                email: Some("ada@example.com".into()),
                name: None,
            }),
        }
    }

    fn reply_events(text: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::Chunk(text.into()), StreamEvent::Done]
    }

    fn service(source: Arc<dyn ReplySource>) -> ChatService {
        ChatService::new(ChatSession::new(), source, AppSettings::default(), signed_in())
    }

    fn visible_texts(store: &HistoryStore, id: &str) -> Vec<String> {
        let conv = store.conversation(id).unwrap();
        branch::visibility(conv)
            .records(conv)
            .into_iter()
            .map(|m| m.text.clone())
            .collect()
    }

    #[test]
    fn test_session_single_flight() {
        let session = ChatSession::new();
        let (token, _cancel) = session.begin("c1").unwrap();
        assert!(matches!(session.begin("c2"), Err(ChatError::Busy)));
        assert_eq!(session.in_flight_conversation().as_deref(), Some("c1"));

        session.complete(token).unwrap();
        assert!(!session.is_busy());
        assert!(matches!(session.complete(token), Err(ChatError::Stale)));
    }

    #[test]
    fn test_session_reset_makes_token_stale() {
        let session = ChatSession::new();
        let (token, cancel) = session.begin("c1").unwrap();
        session.reset();
        assert!(cancel.is_cancelled());
        assert!(!session.is_current(token));
        assert!(session.begin("c1").is_ok());
    }

    #[tokio::test]
    async fn test_send_message_attaches_reply_and_topic() {
        let source = Arc::new(ScriptedSource::new(vec![
            StreamEvent::Chunk("Hello ".into()),
            StreamEvent::Chunk("there".into()),
            StreamEvent::Topic("Greetings".into()),
            StreamEvent::Done,
        ]));
        let chat = service(source.clone());
        let mut store = HistoryStore::new();
        let id = store.new_conversation();

        let outcome = chat.send_message(&mut store, &id, "hi", Vec::new()).await.unwrap();
        assert_eq!(outcome.reply.text, "Hello there");
        assert_eq!(outcome.reply.parent, Some(outcome.user.key()));
        assert_eq!(outcome.topic.as_deref(), Some("Greetings"));
        assert_eq!(store.conversation(&id).unwrap().topic, "Greetings");
        assert_eq!(visible_texts(&store, &id), vec!["hi", "Hello there"]);
        assert!(!chat.session().is_busy());

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests[0].version, 1);
        assert_eq!(requests[0].context, "[]");
        assert_eq!(requests[0].model, "deepseek-r1");
    }

    #[tokio::test]
    async fn test_second_message_carries_context_and_parent() {
        let source = Arc::new(ScriptedSource::new(reply_events("ok")));
        let chat = service(source.clone());
        let mut store = HistoryStore::new();
        let id = store.new_conversation();

        let first = chat.send_message(&mut store, &id, "one", Vec::new()).await.unwrap();
        chat.send_message(&mut store, &id, "two", Vec::new()).await.unwrap();

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests[1].parent_message_id, Some(first.user.key().to_string()));
        let context: Vec<serde_json::Value> = serde_json::from_str(&requests[1].context).unwrap();
        assert_eq!(context.len(), 2);
        assert_eq!(context[1]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_resend_edit_creates_new_branch() {
        let chat = service(Arc::new(ScriptedSource::new(reply_events("answer"))));
        let mut store = HistoryStore::new();
        let id = store.new_conversation();
        let first = chat.send_message(&mut store, &id, "question", Vec::new()).await.unwrap();

        let edited = chat
            .resend_edit(&mut store, &id, &first.user.id, "better question", Vec::new())
            .await
            .unwrap();
        assert_eq!(edited.user.version, 2);
        assert_eq!(visible_texts(&store, &id), vec!["better question", "answer"]);

        store.select_version(&id, &first.user.id, 1).unwrap();
        assert_eq!(visible_texts(&store, &id), vec!["question", "answer"]);
        assert!(branch::check_consistency(store.conversation(&id).unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_adds_reply_version() {
        let chat = service(Arc::new(ScriptedSource::new(reply_events("again"))));
        let mut store = HistoryStore::new();
        let id = store.new_conversation();
        let first = chat.send_message(&mut store, &id, "q", Vec::new()).await.unwrap();

        let regenerated = chat.regenerate(&mut store, &id, &first.reply.id).await.unwrap();
        assert_eq!(regenerated.reply.id, first.reply.id);
        assert_eq!(regenerated.reply.version, 2);
        assert_eq!(
            store.conversation(&id).unwrap().versions_of(&first.reply.id),
            vec![1, 2]
        );
        assert_eq!(visible_texts(&store, &id).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_restores_checkpoint() {
        let chat = service(Arc::new(FailingSource));
        let mut store = HistoryStore::new();
        let id = store.new_conversation();
        let before = store.conversation(&id).unwrap().clone();

        let err = chat.send_message(&mut store, &id, "hi", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::Remote(RemoteError::Http { status: 502, .. })));
        assert_eq!(store.conversation(&id).unwrap(), &before);
        assert!(!chat.session().is_busy());
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let chat = service(Arc::new(ScriptedSource::new(vec![StreamEvent::Done])));
        let mut store = HistoryStore::new();
        let id = store.new_conversation();

        let err = chat.send_message(&mut store, &id, "hi", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::Remote(RemoteError::InvalidResponse(_))));
        assert!(store.conversation(&id).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_not_signed_in() {
        let chat = ChatService::new(
            ChatSession::new(),
            Arc::new(ScriptedSource::new(reply_events("x"))),
            AppSettings::default(),
            AuthState::default(),
        );
        let mut store = HistoryStore::new();
        let id = store.new_conversation();
        let err = chat.send_message(&mut store, &id, "hi", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::Remote(RemoteError::NotAuthenticated)));
        assert!(!chat.session().is_busy());

        assert_eq!(visible_texts(&store, &id), vec!["hi", SIGN_IN_NOTICE]);
        let conv = store.conversation(&id).unwrap();
        let notice = conv.messages.iter().find(|m| !m.is_user()).unwrap();
        assert!(notice.is_error);

        let context = build_context(conv, None, MAX_CONTEXT_MESSAGES);
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].content, "hi");
    }

    #[tokio::test]
    async fn test_cancel_restores_checkpoint() {
        let source = Arc::new(ScriptedSource::hanging(vec![StreamEvent::Chunk("partial".into())]));
        let started = source.started.clone();
        let chat = service(source);
        let session = chat.session().clone();
        let mut store = HistoryStore::new();
        let id = store.new_conversation();
        let before = store.conversation(&id).unwrap().clone();

        let task = tokio::spawn(async move {
            let result = chat.send_message(&mut store, &id, "hi", Vec::new()).await;
            (result, store, id)
        });
        started.notified().await;
        assert!(session.cancel());

        let (result, store, id) = task.await.unwrap();
        assert!(matches!(result, Err(ChatError::Cancelled)));
        assert_eq!(store.conversation(&id).unwrap(), &before);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_abandoned_request_is_stale() {
        let source = Arc::new(ScriptedSource::hanging(Vec::new()));
        let started = source.started.clone();
        let chat = service(source);
        let session = chat.session().clone();
        let mut store = HistoryStore::new();
        let id = store.new_conversation();

        let task = tokio::spawn(async move {
            let result = chat.send_message(&mut store, &id, "hi", Vec::new()).await;
            (result, store, id)
        });
        started.notified().await;
        session.reset();

        let (result, store, id) = task.await.unwrap();
        assert!(matches!(result, Err(ChatError::Stale)));
        // The user's message stays; no reply was attached.
        assert_eq!(visible_texts(&store, &id), vec!["hi"]);
    }
}
