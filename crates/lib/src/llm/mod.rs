//! Remote model abstraction and the Gemini client.
//!
//! The chat handler only sees [`ChatBackend`]; the gateway plugs in [`GeminiClient`] and tests plug in
//! scripted backends.

mod gemini;

pub use gemini::GeminiClient;

use crate::session::ConversationTurn;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("gemini request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gemini api error: {0}")]
    Api(String),
    #[error("gemini blocked the response: {0}")]
    Blocked(String),
    #[error("malformed gemini response: {0}")]
    Malformed(String),
}

/// A model that can continue a transcript in streaming mode.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Model id, for logs and health output.
    fn model(&self) -> &str;

    /// Send the whole transcript and stream the reply. `on_chunk` is called with each text fragment
    /// in arrival order; the concatenated reply is returned once the remote side finishes.
    /// Dropping the returned future aborts the remote call.
    async fn chat_stream(
        &self,
        turns: &[ConversationTurn],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError>;
}
