use serde::{Deserialize, Serialize};

use crate::model::Usage;

/// Summary of one relayed stream, handed to the installed telemetry sink
/// once the stream has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelayTrace {
    /// Id assigned to the inbound request and forwarded upstream.
    pub request_id: Option<String>,

    /// Model identifier sent upstream, e.g. "qwen-plus".
    pub model: Option<String>,

    /// `StreamOutcome` label, e.g. "delivered", "client_disconnected".
    pub outcome: Option<String>,

    /// HTTP status of a failed upstream call.
    pub upstream_status: Option<u16>,

    /// Fragments and bytes written to the client (diagnostics excluded).
    pub chunks: u64,
    pub bytes: u64,

    /// Events dropped because they did not decode.
    pub skipped_events: u64,

    pub finish_reason: Option<String>,

    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,

    /// Time from request start to the first relayed fragment.
    pub first_byte_ms: Option<u64>,
    pub latency_ms: Option<u64>,
}

impl RelayTrace {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn request_id(mut self, rid: &str) -> Self {
        self.request_id = Some(rid.to_string());
        self
    }
    pub fn model_opt(mut self, model: Option<&str>) -> Self {
        self.model = model.map(|s| s.to_string());
        self
    }
    pub fn outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }
    pub fn upstream_status_opt(mut self, code: Option<u16>) -> Self {
        self.upstream_status = code;
        self
    }
    pub fn counts(mut self, chunks: u64, bytes: u64, skipped: u64) -> Self {
        self.chunks = chunks;
        self.bytes = bytes;
        self.skipped_events = skipped;
        self
    }
    pub fn finish_reason_opt(mut self, reason: Option<&str>) -> Self {
        self.finish_reason = reason.map(|s| s.to_string());
        self
    }
    pub fn usage_opt(mut self, usage: Option<Usage>) -> Self {
        if let Some(u) = usage {
            self.tokens_prompt = Some(u.prompt_tokens);
            self.tokens_completion = Some(u.completion_tokens);
            self.tokens_total = Some(u.total_tokens);
        }
        self
    }
    pub fn first_byte_ms_opt(mut self, ms: Option<u64>) -> Self {
        self.first_byte_ms = ms;
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
}
