//! The single conversation with the remote model.
//!
//! A session is an ordered, append-only transcript seeded with the system instruction and a fixed
//! model acknowledgment. It has no locking of its own: the gateway wraps it in [`SharedSession`]
//! and holds the lock for a whole chat exchange so turns from concurrent requests never interleave.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Model reply that closes the seed pair.
pub const SEED_ACKNOWLEDGMENT: &str =
    "Okay, I'm ready. Show me a screenshot and ask your question any time.";

/// MIME type attached to images sent from the browser (screenshots are always PNG).
pub const IMAGE_MIME_PNG: &str = "image/png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One piece of a turn: text or an opaque image buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image { data: Vec<u8>, mime_type: String },
}

impl ContentPart {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn png(data: Vec<u8>) -> Self {
        Self::Image {
            data,
            mime_type: IMAGE_MIME_PNG.to_string(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Image { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ConversationTurn {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![ContentPart::text(text)],
        }
    }

    /// All text parts joined, images skipped.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(ContentPart::as_text).collect()
    }

    pub fn has_image(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. }))
    }
}

/// Transcript storage. Constructed once via [`ConversationSession::initialize`]; there is no way to
/// reseed an existing session.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    turns: Vec<ConversationTurn>,
}

/// Lock-guarded session shared by request handlers.
pub type SharedSession = Arc<Mutex<ConversationSession>>;

impl ConversationSession {
    /// Seed transcript: the system instruction as a user turn, then the fixed acknowledgment.
    pub fn initialize(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![
                ConversationTurn::user(vec![ContentPart::text(system_prompt)]),
                ConversationTurn::model(SEED_ACKNOWLEDGMENT),
            ],
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn append_user_turn(&mut self, parts: Vec<ContentPart>) {
        self.turns.push(ConversationTurn::user(parts));
    }

    pub fn append_model_turn(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::model(text));
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
