//! Conversation turns and their content parts.
//!
//! A turn is one conversational entry (user or assistant) composed of ordered
//! parts: plain text, or a structured reference to a slide that the composer
//! embedded as a `REF_<n>` placeholder token inside the surrounding text.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix for placeholder tokens embedded in text at compose time.
pub const REFERENCE_TOKEN_PREFIX: &str = "REF_";

/// The author of a conversation turn.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// A run of message text. Mutable while the owning turn is streaming;
/// frozen once its end event arrives.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TextPart {
    /// Part id assigned by the protocol stream (or synthesized locally).
    pub id: String,
    pub text: String,
    /// Set when the part's end event has been received; later deltas are
    /// rejected.
    pub finished: bool,
}

impl TextPart {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: String::new(),
            finished: false,
        }
    }

    /// A completed, immutable text part (used when hydrating stored history).
    pub fn finished(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            finished: true,
        }
    }
}

/// A compose-time reference to a slide, resolved back from its placeholder
/// token when the message is rendered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReferencePart {
    /// Human-readable label, e.g. "current slide".
    pub label: String,
    pub target_type: ReferenceTarget,
    /// Identifier of the referenced object (slide number as a string).
    pub target_id: String,
    /// The `REF_<n>` marker embedded in the surrounding text.
    pub placeholder_token: String,
}

/// What a reference part points at.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceTarget {
    Slide,
}

/// One typed fragment of a turn's content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text(TextPart),
    Reference(ReferencePart),
}

/// One conversational entry composed of ordered parts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Set once the turn's terminal event has been received; no further
    /// parts may be added.
    pub complete: bool,
}

impl ConversationTurn {
    /// Creates a completed user turn from compose-time parts. The id is
    /// generated locally, independent of any server id.
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            parts,
            complete: true,
        }
    }

    /// Creates an empty in-progress assistant turn with a local id.
    pub fn assistant_in_progress() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            parts: Vec::new(),
            complete: false,
        }
    }

    /// Builds the next `REF_<n>` placeholder token for this turn, unique
    /// among the reference parts it already carries.
    pub fn next_placeholder_token(&self) -> String {
        let count = self
            .parts
            .iter()
            .filter(|p| matches!(p, ContentPart::Reference(_)))
            .count();
        format!("{}{}", REFERENCE_TOKEN_PREFIX, count + 1)
    }

    /// Resolves a placeholder token back to its reference part.
    ///
    /// Linear scan, first match wins (duplicate tokens are not forbidden
    /// upstream). Returns `None` for an unmatched token, which the renderer
    /// must display as literal text.
    pub fn resolve_reference(&self, token: &str) -> Option<&ReferencePart> {
        self.parts.iter().find_map(|p| match p {
            ContentPart::Reference(r) if r.placeholder_token == token => Some(r),
            _ => None,
        })
    }

    /// Concatenated text of all text parts, in order. Reference parts
    /// contribute nothing here: their placeholder tokens already live
    /// inside the surrounding text.
    pub fn flattened_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text(t) = part {
                out.push_str(&t.text);
            }
        }
        out
    }
}
