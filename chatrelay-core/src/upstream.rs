use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Span};

use crate::config::{Config, UpstreamSettings};
use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, ReadLimits, RequestCtx, SseStream};
use crate::model::UpstreamRequest;
use crate::sse::FrameStream;
use crate::telemetry::KEY_KEY_FINGERPRINT;

/// Decoded chunks of one upstream response. Dropping it closes the upstream
/// connection.
pub type ChunkStream = FrameStream<SseStream>;

/// Opens streaming chat-completion calls against an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: HttpClient,
    limits: ReadLimits,
}

impl UpstreamClient {
    pub fn new(http: HttpClient, limits: ReadLimits) -> Self {
        Self { http, limits }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let http = HttpClient::from_cfg(&cfg.http)?;
        Ok(Self::new(
            http,
            ReadLimits {
                max_line_bytes: cfg.stream.max_line_bytes,
                error_excerpt_bytes: cfg.stream.error_excerpt_bytes,
            },
        ))
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Self {
        Self::new(HttpClient::new_default().unwrap(), ReadLimits::default())
    }

    fn headers(api_key: &SecretString) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    /// Issue the streaming POST. Resolves once response headers arrive; a
    /// cancelled `cancel` abandons the attempt and drops the connection.
    pub async fn open(
        &self,
        settings: &UpstreamSettings,
        prompt: &str,
        ctx: &RequestCtx<'_>,
        cancel: &CancellationToken,
    ) -> CoreResult<ChunkStream> {
        let payload = UpstreamRequest::for_prompt(&settings.model, prompt, settings.include_usage);
        let owned_headers = Self::headers(&settings.api_key);
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let key_fp = key_fingerprint(&settings.api_key);
        Span::current().record(KEY_KEY_FINGERPRINT, key_fp.as_str());
        debug!(
            endpoint = %settings.endpoint,
            model = %payload.model(),
            key = %key_fp,
            "opening upstream stream"
        );

        let call = self
            .http
            .post_sse_lines(&settings.endpoint, &payload, &hdrs, ctx, self.limits);
        let lines = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::ClientGone),
            res = call => res,
        };
        match lines {
            Ok(lines) => Ok(FrameStream::new(lines)),
            Err(e) => {
                warn!(
                    error.kind = e.kind(),
                    error = %e,
                    key = %key_fp,
                    "upstream call failed"
                );
                Err(e)
            }
        }
    }
}

/// Loggable stand-in for an API key: its length and last four characters.
pub fn key_fingerprint(key: &SecretString) -> String {
    let k = key.expose_secret();
    let n = k.chars().count();
    if n <= 8 {
        return format!("len={n}");
    }
    let suffix: String = k.chars().skip(n - 4).collect();
    format!("len={n} ...{suffix}")
}
