//! Chat stream transport: one outbound request per user turn.
//!
//! The transport owns the network exchange for a turn and drives the message
//! store through the `idle → submitted → streaming → (idle | error)` state
//! machine. It enforces at-most-one in-flight turn per chat, flattens
//! reference parts before transmission, and reads the model id at send time
//! so a model switch takes effect on the next turn.
//!
//! A transport is constructed per `(lectureId, chatId)` pair and never
//! reused across identities; a stream that outlives its identity finds its
//! mutations rejected by the store's identity check.

use crate::config::Config;
use crate::error::TransportError;
use crate::message::{ContentPart, ConversationTurn, Role};
use crate::protocol::{FrameDecoder, StreamEvent};
use crate::store::{ChatIdentity, MessageStore, StreamState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The raw byte stream of a chat response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Outbound request body for one turn: the model id read at send time and
/// the turn's text parts. Reference parts are not transmitted; their
/// placeholder tokens already live inside the surrounding text and the
/// backend need not understand reference semantics.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub parts: Vec<OutboundPart>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundPart {
    Text { text: String },
}

/// The chat-completion collaborator reached for each turn.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issues the streaming request for one turn. A non-success HTTP status
    /// is an error carrying the response body verbatim.
    async fn stream_chat(
        &self,
        identity: &ChatIdentity,
        request: ChatRequest,
    ) -> Result<ByteStream, TransportError>;
}

/// One active chat identity plus its mutable model selection.
///
/// The model id lives behind a shared cell and is read when a send happens,
/// not when the session is created, so switching models mid-session affects
/// only the next turn.
#[derive(Clone, Debug)]
pub struct TransportSession {
    identity: ChatIdentity,
    model: Arc<RwLock<String>>,
}

impl TransportSession {
    pub fn new(identity: ChatIdentity, model: impl Into<String>) -> Self {
        Self {
            identity,
            model: Arc::new(RwLock::new(model.into())),
        }
    }

    pub fn identity(&self) -> &ChatIdentity {
        &self.identity
    }

    /// The currently selected model id.
    pub fn model(&self) -> String {
        match self.model.read() {
            Ok(model) => model.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Switches the model for subsequent turns.
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        debug!(identity = %self.identity, %model, "model switched");
        match self.model.write() {
            Ok(mut slot) => *slot = model,
            Err(poisoned) => *poisoned.into_inner() = model,
        }
    }
}

/// Owns the single in-flight exchange for one chat identity and feeds the
/// message store with decoded protocol events.
pub struct ChatTransport<B: ChatBackend> {
    backend: Arc<B>,
    session: TransportSession,
    store: Arc<Mutex<MessageStore>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: ChatBackend + 'static> ChatTransport<B> {
    pub fn new(backend: Arc<B>, session: TransportSession) -> Self {
        let store = MessageStore::new(session.identity().clone());
        Self {
            backend,
            session,
            store: Arc::new(Mutex::new(store)),
            task: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    /// Shared handle to the message store this transport mutates.
    pub fn store(&self) -> Arc<Mutex<MessageStore>> {
        Arc::clone(&self.store)
    }

    /// Sends one user turn and begins streaming the reply into the store.
    ///
    /// Contract violations (non-user turn, empty turn, a turn already in
    /// flight) are rejected synchronously before any network call. A
    /// request failure surfaces its message, resets the store to idle, and
    /// returns the error so the caller may retry.
    pub async fn send(&self, turn: ConversationTurn) -> Result<(), TransportError> {
        if turn.role != Role::User {
            return Err(TransportError::NotUserTurn);
        }
        let parts = outbound_parts(&turn);
        if parts.is_empty() {
            return Err(TransportError::EmptyTurn);
        }
        // Model id is read here, at send time, through the session cell.
        let request = ChatRequest {
            model: self.session.model(),
            parts,
        };

        // The task slot is held across the whole exchange: a concurrent
        // `stop` waits here until the spawned handle is stored, then aborts
        // it, instead of slipping in between submit and spawn.
        let mut task = self.task.lock().await;
        {
            let mut store = self.store.lock().await;
            if matches!(
                store.state(),
                StreamState::Submitted | StreamState::Streaming
            ) {
                return Err(TransportError::TurnInFlight);
            }
            store.push_turn(turn);
            store.mark_submitted();
        }

        let identity = self.session.identity().clone();
        let stream = match self.backend.stream_chat(&identity, request).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut store = self.store.lock().await;
                store.fail_and_reset(&identity, e.to_string());
                return Err(e);
            }
        };

        let store = Arc::clone(&self.store);
        *task = Some(tokio::spawn(drive_stream(stream, store, identity)));
        Ok(())
    }

    /// Cancels the in-flight stream read, keeping any text already applied.
    /// Safe to call when nothing is in flight.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            debug!(identity = %self.session.identity(), "aborted in-flight stream");
        }
        let mut store = self.store.lock().await;
        if matches!(
            store.state(),
            StreamState::Submitted | StreamState::Streaming
        ) {
            store.mark_idle();
        }
    }

    /// Resuming a dropped stream is not supported: the backend keeps no
    /// cursor to resume from. Callers must retry the full turn.
    pub fn reconnect_to_stream(&self) -> Result<(), TransportError> {
        Err(TransportError::ReconnectUnsupported)
    }
}

/// Reads the byte stream to completion, decoding frames and applying the
/// resulting events to the store in arrival order. Stream close without an
/// explicit terminal frame counts as an implicit finish.
async fn drive_stream(
    mut stream: ByteStream,
    store: Arc<Mutex<MessageStore>>,
    identity: ChatIdentity,
) {
    let mut decoder = FrameDecoder::new();
    while let Some(read) = stream.next().await {
        match read {
            Ok(bytes) => {
                let events = decoder.feed(&bytes);
                if !events.is_empty() {
                    let mut store = store.lock().await;
                    for event in events {
                        store.apply(&identity, event);
                    }
                }
                if decoder.is_finished() {
                    break;
                }
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "stream read failed");
                store.lock().await.fail_and_reset(&identity, e.to_string());
                return;
            }
        }
    }
    let mut store = store.lock().await;
    store.apply(&identity, StreamEvent::Finish);
}

fn outbound_parts(turn: &ConversationTurn) -> Vec<OutboundPart> {
    turn.parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(t) => Some(OutboundPart::Text {
                text: t.text.clone(),
            }),
            ContentPart::Reference(_) => None,
        })
        .collect()
}

/// `ChatBackend` implementation against the real HTTP backend.
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpChatBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn stream_chat(
        &self,
        identity: &ChatIdentity,
        request: ChatRequest,
    ) -> Result<ByteStream, TransportError> {
        let url = format!(
            "{}/lectures/{}/chats/{}/stream",
            self.base_url, identity.lecture_id, identity.chat_id
        );
        debug!(%url, model = %request.model, "issuing chat stream request");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| TransportError::Network(e.to_string())),
        ))
    }
}
