//! Typed interfaces to the backend REST collaborators.
//!
//! The CRUD backend, model catalog, and push channel are external systems;
//! this module defines the narrow trait surface the core consumes plus the
//! row/model types they exchange. Implementations live outside the core
//! (tests use hand-written fakes or `mockall` mocks).

use crate::error::ApiError;
use crate::message::{ContentPart, ConversationTurn, Role, TextPart};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing pipeline status of an uploaded lecture.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Uploading,
    PendingProcessing,
    Parsing,
    Processing,
    Complete,
    Failed,
}

impl ProcessingStatus {
    /// Terminal states: processing will make no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Complete | ProcessingStatus::Failed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chat {
    pub id: String,
    pub lecture_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted chat message row, as returned by the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Lecture {
    pub id: String,
    pub title: String,
    pub course_id: String,
    pub status: ProcessingStatus,
    /// Failure detail populated when `status` is `failed`.
    pub embedding_error_details: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Explanation {
    pub slide_number: u32,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelProvider {
    pub provider: String,
    pub models: Vec<ModelInfo>,
}

/// Chat CRUD operations owned by the backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn create_chat(&self, lecture_id: &str, title: Option<&str>) -> Result<Chat, ApiError>;
    async fn get_chats(
        &self,
        lecture_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Chat>, ApiError>;
    async fn get_messages(
        &self,
        lecture_id: &str,
        chat_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, ApiError>;
    async fn delete_chat(&self, lecture_id: &str, chat_id: &str) -> Result<(), ApiError>;
}

/// Lecture data owned by the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LectureApi: Send + Sync {
    async fn get_lecture(&self, lecture_id: &str) -> Result<Lecture, ApiError>;
    async fn get_signed_pdf_url(&self, lecture_id: &str) -> Result<String, ApiError>;
    async fn get_explanations(&self, lecture_id: &str) -> Result<Vec<Explanation>, ApiError>;
    /// `None` while no summary has been generated yet.
    async fn get_summary(&self, lecture_id: &str) -> Result<Option<Summary>, ApiError>;
}

/// The user's model catalog, grouped by provider.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn get_user_models(&self) -> Result<Vec<ModelProvider>, ApiError>;
}

/// Hydrates stored history rows into conversation turns for the message
/// store. Each row becomes one completed turn with a single immutable text
/// part whose id is derived from the row id.
pub fn turns_from_stored(messages: Vec<StoredMessage>) -> Vec<ConversationTurn> {
    messages
        .into_iter()
        .map(|m| ConversationTurn {
            parts: vec![ContentPart::Text(TextPart::finished(
                format!("part-{}", m.id),
                m.content,
            ))],
            id: m.id,
            role: m.role,
            complete: true,
        })
        .collect()
}
