/// Span/Log attribute keys for relayed streams.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_REQUEST_ID: &str = "req.id";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_KEY_FINGERPRINT: &str = "llm.key_fp";

pub const KEY_OUTCOME: &str = "relay.outcome";
pub const KEY_CHUNKS: &str = "relay.chunks";
pub const KEY_BYTES: &str = "relay.bytes";
pub const KEY_SKIPPED_EVENTS: &str = "relay.skipped";
pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_FIRST_BYTE_MS: &str = "latency.first_byte_ms";
pub const KEY_FINISH_REASON: &str = "finish.reason";
pub const KEY_TOKENS_PROMPT: &str = "tokens.prompt";
pub const KEY_TOKENS_COMPLETION: &str = "tokens.completion";
pub const KEY_TOKENS_TOTAL: &str = "tokens.total";

/// Error-related (if applicable)
pub const KEY_UPSTREAM_STATUS: &str = "upstream.status";
pub const KEY_ERROR_KIND: &str = "error.kind";
