use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};
use crate::normalizer::clean_prompt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Inbound body of `POST /ai/chat/stream`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PromptRequest {
    #[serde(default)]
    pub prompt: String,
}

impl PromptRequest {
    /// Decode a raw request body. Malformed JSON and blank prompts are both
    /// validation failures; the returned prompt is normalized and trimmed.
    pub fn parse(body: &[u8]) -> CoreResult<String> {
        let req: PromptRequest = serde_json::from_slice(body)
            .map_err(|e| RelayError::Validation(format!("invalid json: {e}")))?;
        let prompt = clean_prompt(&req.prompt);
        if prompt.is_empty() {
            return Err(RelayError::EmptyPrompt);
        }
        Ok(prompt)
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Body of the upstream streaming chat-completions call. Built once per
/// inbound request and never mutated afterwards.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct UpstreamRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl UpstreamRequest {
    pub fn for_prompt(model: impl Into<String>, prompt: impl Into<String>, include_usage: bool) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: prompt.into(),
            }],
            stream: true,
            stream_options: Some(StreamOptions { include_usage }),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One decoded upstream event (OpenAI-compatible `chat.completion.chunk`).
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct DecodedChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl DecodedChunk {
    /// Text of the first choice's delta; empty when there is nothing to show.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

/// How a single relayed stream ended. Everything except `Delivered` was
/// reported to the client as body text, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Delivered,
    UpstreamConnectFailed,
    UpstreamStatusError { code: u16, excerpt: String },
    ConfigMissing { which: String },
    ClientDisconnected,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::UpstreamStatusError { .. } => "upstream_status_error",
            Self::ConfigMissing { .. } => "config_missing",
            Self::ClientDisconnected => "client_disconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upstream_request_wire_shape() {
        let req = UpstreamRequest::for_prompt("qwen-plus", "hi", true);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({
                "model": "qwen-plus",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "stream_options": {"include_usage": true}
            })
        );
    }

    #[test]
    fn prompt_is_trimmed() {
        let prompt = PromptRequest::parse(br#"{"prompt":"  hello \r\n"}"#).unwrap();
        assert_eq!(prompt, "hello");
    }

    #[test]
    fn blank_or_missing_prompt_rejected() {
        for body in [&br#"{"prompt":"   "}"#[..], br#"{}"#, br#"{"prompt":""}"#] {
            let err = PromptRequest::parse(body).unwrap_err();
            assert!(matches!(err, RelayError::EmptyPrompt));
        }
    }

    #[test]
    fn malformed_json_rejected() {
        let err = PromptRequest::parse(b"{not json").unwrap_err();
        match err {
            RelayError::Validation(msg) => assert!(msg.starts_with("invalid json")),
            other => panic!("expected Validation, got: {:?}", other),
        }
    }

    #[test]
    fn chunk_content_and_finish_reason() {
        let c: DecodedChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"content": "A"}, "finish_reason": "stop"}]
        }))
        .unwrap();
        assert_eq!(c.content(), "A");
        assert_eq!(c.finish_reason(), Some("stop"));
    }

    #[test]
    fn chunk_without_choices_or_with_null_content_is_empty() {
        let usage_only: DecodedChunk = serde_json::from_value(json!({
            "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
        }))
        .unwrap();
        assert_eq!(usage_only.content(), "");
        assert_eq!(usage_only.usage.unwrap().total_tokens, 8);

        let role_only: DecodedChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"role": "assistant", "content": null}, "finish_reason": null}]
        }))
        .unwrap();
        assert_eq!(role_only.content(), "");
        assert_eq!(role_only.finish_reason(), None);
    }
}
