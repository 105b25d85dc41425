//! Gemini API client (`streamGenerateContent` with `alt=sse`).

use crate::llm::{ChatBackend, LlmError};
use crate::session::{ContentPart, ConversationTurn, Role};
use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Finish reasons that mean the model refused rather than ran out of things to say.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

/// Client for the Gemini generative language API.
#[derive(Clone)]
pub struct GeminiClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Build the client. Proxy environment variables must already be set: reqwest reads them here.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            model: model.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl ChatBackend for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    /// POST streamGenerateContent. Parses SSE `data:` lines and calls on_chunk for each text delta.
    async fn chat_stream(
        &self,
        turns: &[ConversationTurn],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError> {
        let body = GenerateContentRequest::from_turns(turns);
        let res = self
            .client
            .post(self.stream_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }

        let mut stream = res.bytes_stream();
        let mut buffer = Vec::new();
        let mut content = String::new();
        let mut finish_reason: Option<String> = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LlmError::Request)?;
            buffer.extend_from_slice(&chunk);
            while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..i).collect();
                buffer.drain(..1);
                let line = String::from_utf8_lossy(&line_bytes);
                let Some(delta) = parse_data_line(&line)? else {
                    continue;
                };
                if let Some(reason) = delta.finish_reason {
                    finish_reason = Some(reason);
                }
                if !delta.text.is_empty() {
                    on_chunk(&delta.text);
                    content.push_str(&delta.text);
                }
            }
        }
        // Trailing event without a final newline.
        if let Some(delta) = parse_data_line(&String::from_utf8_lossy(&buffer))? {
            if let Some(reason) = delta.finish_reason {
                finish_reason = Some(reason);
            }
            if !delta.text.is_empty() {
                on_chunk(&delta.text);
                content.push_str(&delta.text);
            }
        }

        if content.is_empty() {
            return Err(match finish_reason {
                Some(r) if BLOCKING_FINISH_REASONS.contains(&r.as_str()) => LlmError::Blocked(r),
                Some(r) => LlmError::Malformed(format!("no text in response (finish reason {})", r)),
                None => LlmError::Malformed("no text in response".to_string()),
            });
        }
        Ok(content)
    }
}

/// Text and finish reason carried by one SSE event.
#[derive(Debug, Default, PartialEq, Eq)]
struct StreamDelta {
    text: String,
    finish_reason: Option<String>,
}

/// Parse one SSE line. Non-data lines (comments, blank separators) yield `None`.
fn parse_data_line(line: &str) -> Result<Option<StreamDelta>, LlmError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim_start();
    if data.is_empty() {
        return Ok(None);
    }
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::Malformed(format!("{}: {}", e, data)))?;
    chunk.into_delta().map(Some)
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: Role,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WirePart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    /// Base64 (standard alphabet) image bytes.
    data: String,
}

impl GenerateContentRequest {
    fn from_turns(turns: &[ConversationTurn]) -> Self {
        let contents = turns
            .iter()
            .map(|turn| WireContent {
                role: turn.role,
                parts: turn.parts.iter().map(WirePart::from).collect(),
            })
            .collect();
        Self { contents }
    }
}

impl From<&ContentPart> for WirePart {
    fn from(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text(text) => WirePart::Text { text: text.clone() },
            ContentPart::Image { data, mime_type } => WirePart::InlineData {
                inline_data: InlineData {
                    mime_type: mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    /// Thought summaries are not part of the reply.
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl StreamChunk {
    fn into_delta(self) -> Result<StreamDelta, LlmError> {
        if let Some(err) = self.error {
            return Err(LlmError::Api(format!(
                "{} {}: {}",
                err.code.map(|c| c.to_string()).unwrap_or_default(),
                err.status.unwrap_or_default(),
                err.message
            )));
        }
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(LlmError::Blocked(reason));
        }
        let mut delta = StreamDelta::default();
        if let Some(candidate) = self.candidates.into_iter().next() {
            delta.finish_reason = candidate.finish_reason;
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if part.thought {
                    continue;
                }
                if let Some(text) = part.text {
                    delta.text.push_str(&text);
                }
            }
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConversationSession;

    #[test]
    fn request_body_uses_gemini_roles_and_inline_data() {
        let mut s = ConversationSession::initialize("be brief");
        s.append_user_turn(vec![ContentPart::text("what is this?"), ContentPart::png(vec![0x89, b'P', b'N', b'G'])]);
        let body = serde_json::to_value(GenerateContentRequest::from_turns(s.turns())).unwrap();

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "be brief");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "what is this?");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["data"], "iVBORw==");
    }

    #[test]
    fn data_line_yields_text_and_skips_thoughts() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"plan","thought":true},{"text":"Hel"}]}}]}"#;
        let delta = parse_data_line(line).unwrap().unwrap();
        assert_eq!(delta.text, "Hel");
        assert_eq!(delta.finish_reason, None);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(parse_data_line("").unwrap().is_none());
        assert!(parse_data_line(": keep-alive").unwrap().is_none());
        assert!(parse_data_line("event: message").unwrap().is_none());
    }

    #[test]
    fn finish_reason_is_carried() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"!"}]},"finishReason":"STOP"}]}"#;
        let delta = parse_data_line(line).unwrap().unwrap();
        assert_eq!(delta.text, "!");
        assert_eq!(delta.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn error_and_block_payloads_fail() {
        let err = parse_data_line(
            r#"data: {"error":{"code":429,"message":"quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::Api(ref m) if m.contains("quota exceeded")));

        let err = parse_data_line(r#"data: {"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap_err();
        assert!(matches!(err, LlmError::Blocked(ref r) if r == "SAFETY"));

        let err = parse_data_line("data: {oops").unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[test]
    fn stream_url_includes_model_and_sse() {
        let c = GeminiClient::new("k", "gemini-2.5-pro", Some("http://127.0.0.1:9/".to_string()));
        assert_eq!(
            c.stream_url(),
            "http://127.0.0.1:9/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
    }
}
