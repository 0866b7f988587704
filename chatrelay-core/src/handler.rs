//! `POST /ai/chat/stream` entry point.
//!
//! Request handling has two phases with different failure channels:
//!
//! 1. **Pre-commit** ([`admit`]): method and body checks. Failures become a
//!    real HTTP status (204 / 405 / 400) because nothing has been sent yet.
//! 2. **Post-commit** ([`relay`]): the 200 status line and headers are gone,
//!    so failures can only be appended to the body as a diagnostic sentence,
//!    or absorbed silently when the client is no longer there to read it.
//!
//! The types enforce the split: [`admit`] returns a [`Rejection`] that turns
//! into a status response, while [`relay`] only ever returns a
//! [`StreamOutcome`] for logging.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use futures_util::stream::{Stream, StreamExt};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use crate::config::Config;
use crate::emitter::{BodyFrame, BodySink, ChunkEmitter, ChunkSink};
use crate::error::RelayError;
use crate::http_client::RequestCtx;
use crate::model::{PromptRequest, StreamOutcome, Usage};
use crate::telemetry::{self, RelayTrace};
use crate::upstream::UpstreamClient;

/// Largest inbound body accepted for a prompt.
pub const MAX_BODY_BYTES: usize = 1 << 20;

/// Frames buffered between the relay task and the HTTP body. Kept at one so
/// the relay never runs ahead of what the transport has taken.
const BODY_CHANNEL_DEPTH: usize = 1;

/// Shared, read-only state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(cfg: Config) -> crate::error::CoreResult<Self> {
        let upstream = UpstreamClient::from_config(&cfg)?;
        Ok(Self {
            cfg: Arc::new(cfg),
            upstream,
        })
    }
}

/// Pre-commit failure, answered with a status code and a short plain body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: &'static str,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Pre-commit verdict.
#[derive(Debug, PartialEq, Eq)]
pub enum Admitted {
    /// CORS preflight, answered with an empty 204.
    Preflight,
    Prompt { prompt: String, request_id: String },
}

/// Axum handler mounted on the streaming route for every method.
pub async fn chat_stream(State(state): State<AppState>, req: Request) -> Response {
    match admit(req).await {
        Err(rejection) => rejection.into_response(),
        Ok(Admitted::Preflight) => StatusCode::NO_CONTENT.into_response(),
        Ok(Admitted::Prompt { prompt, request_id }) => commit(state, prompt, request_id),
    }
}

/// Method and body validation. The body is only read for `POST`.
pub async fn admit(req: Request) -> Result<Admitted, Rejection> {
    match *req.method() {
        Method::OPTIONS => return Ok(Admitted::Preflight),
        Method::POST => {}
        _ => {
            return Err(Rejection {
                status: StatusCode::METHOD_NOT_ALLOWED,
                message: "method not allowed",
            });
        }
    }
    let request_id = request_id_from(req.headers());
    let body = to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            debug!(error = %e, "request body unreadable");
            Rejection {
                status: StatusCode::BAD_REQUEST,
                message: "invalid body",
            }
        })?;
    match PromptRequest::parse(&body) {
        Ok(prompt) => Ok(Admitted::Prompt { prompt, request_id }),
        Err(e) => {
            debug!(error = %e, "prompt rejected");
            let message = match e {
                RelayError::EmptyPrompt => "prompt is empty",
                _ => "invalid json",
            };
            Err(Rejection {
                status: StatusCode::BAD_REQUEST,
                message,
            })
        }
    }
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// The point of no return: builds the 200 streaming response and starts the
/// relay task that feeds it.
fn commit(state: AppState, prompt: String, request_id: String) -> Response {
    let (tx, rx) = mpsc::channel::<BodyFrame>(BODY_CHANNEL_DEPTH);
    let cancel = CancellationToken::new();
    let body = RelayBody {
        frames: ReceiverStream::new(rx),
        _client_alive: cancel.clone().drop_guard(),
    };

    let task_cancel = cancel;
    tokio::spawn(async move {
        relay(
            &state.upstream,
            &state.cfg,
            &prompt,
            BodySink::new(tx),
            task_cancel,
            &request_id,
        )
        .await;
    });

    let mut resp = Response::new(Body::from_stream(body));
    let h = resp.headers_mut();
    h.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

/// Streaming response body. When the transport drops it (client gone or
/// response finished) the guard cancels the relay's token.
struct RelayBody {
    frames: ReceiverStream<BodyFrame>,
    _client_alive: DropGuard,
}

impl Stream for RelayBody {
    type Item = BodyFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_next_unpin(cx)
    }
}

#[derive(Debug, Default)]
struct RelayReport {
    model: Option<String>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    skipped: u64,
    first_byte_ms: Option<u64>,
}

/// Post-commit phase: resolve configuration, open the upstream stream and
/// copy text fragments into `sink` until the stream ends or the client
/// leaves. Never fails; the outcome is for logging only.
pub async fn relay<S: ChunkSink>(
    upstream: &UpstreamClient,
    cfg: &Config,
    prompt: &str,
    sink: S,
    cancel: CancellationToken,
    request_id: &str,
) -> StreamOutcome {
    let started = Instant::now();
    // Names must match the `telemetry::KEY_*` constants recorded below.
    let span = info_span!(
        "relay",
        "req.id" = field::Empty,
        "llm.model" = field::Empty,
        "llm.key_fp" = field::Empty,
        "relay.outcome" = field::Empty,
        "relay.chunks" = field::Empty,
        "relay.bytes" = field::Empty,
        "relay.skipped" = field::Empty,
        "latency.ms" = field::Empty,
        "latency.first_byte_ms" = field::Empty,
        "finish.reason" = field::Empty,
        "tokens.prompt" = field::Empty,
        "tokens.completion" = field::Empty,
        "tokens.total" = field::Empty,
        "upstream.status" = field::Empty,
        "error.kind" = field::Empty,
    );
    span.record(telemetry::KEY_REQUEST_ID, request_id);
    let mut emitter = ChunkEmitter::new(sink, cfg.stream.flush);
    let mut report = RelayReport::default();

    let outcome = drive(
        upstream,
        cfg,
        prompt,
        &mut emitter,
        &cancel,
        request_id,
        &mut report,
        started,
    )
    .instrument(span.clone())
    .await;

    let stats = emitter.stats();
    let latency_ms = started.elapsed().as_millis() as u64;
    if let Some(model) = report.model.as_deref() {
        span.record(telemetry::KEY_MODEL, model);
    }
    span.record(telemetry::KEY_OUTCOME, outcome.as_str());
    span.record(telemetry::KEY_CHUNKS, stats.chunks);
    span.record(telemetry::KEY_BYTES, stats.bytes);
    span.record(telemetry::KEY_SKIPPED_EVENTS, report.skipped);
    span.record(telemetry::KEY_LATENCY_MS, latency_ms);
    span.record(telemetry::KEY_FIRST_BYTE_MS, report.first_byte_ms);
    span.record(telemetry::KEY_FINISH_REASON, report.finish_reason.as_deref());
    if let Some(usage) = report.usage {
        span.record(telemetry::KEY_TOKENS_PROMPT, usage.prompt_tokens);
        span.record(telemetry::KEY_TOKENS_COMPLETION, usage.completion_tokens);
        span.record(telemetry::KEY_TOKENS_TOTAL, usage.total_tokens);
    }
    let upstream_status = match &outcome {
        StreamOutcome::UpstreamStatusError { code, .. } => Some(*code),
        _ => None,
    };
    span.record(telemetry::KEY_UPSTREAM_STATUS, upstream_status);

    span.in_scope(|| info!(outcome = outcome.as_str(), "stream finished"));

    telemetry::emit(
        RelayTrace::new()
            .request_id(request_id)
            .model_opt(report.model.as_deref())
            .outcome(outcome.as_str())
            .upstream_status_opt(upstream_status)
            .counts(stats.chunks, stats.bytes, report.skipped)
            .finish_reason_opt(report.finish_reason.as_deref())
            .usage_opt(report.usage)
            .first_byte_ms_opt(report.first_byte_ms)
            .latency_ms(latency_ms),
    );
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn drive<S: ChunkSink>(
    upstream: &UpstreamClient,
    cfg: &Config,
    prompt: &str,
    emitter: &mut ChunkEmitter<S>,
    cancel: &CancellationToken,
    request_id: &str,
    report: &mut RelayReport,
    started: Instant,
) -> StreamOutcome {
    let settings = match cfg.upstream.resolve() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "upstream not configured");
            let which = match &e {
                RelayError::ConfigMissing { which } => which.clone(),
                other => other.kind().to_string(),
            };
            return degrade(emitter, &e, StreamOutcome::ConfigMissing { which }).await;
        }
    };
    report.model = Some(settings.model.clone());
    Span::current().record(telemetry::KEY_MODEL, settings.model.as_str());

    let ctx = RequestCtx {
        request_id: Some(request_id),
    };
    let mut chunks = match upstream.open(&settings, prompt, &ctx, cancel).await {
        Ok(chunks) => chunks,
        Err(RelayError::ClientGone) => return StreamOutcome::ClientDisconnected,
        Err(e) => {
            let outcome = match &e {
                RelayError::UpstreamStatus { code, excerpt } => StreamOutcome::UpstreamStatusError {
                    code: *code,
                    excerpt: excerpt.clone(),
                },
                _ => StreamOutcome::UpstreamConnectFailed,
            };
            return degrade(emitter, &e, outcome).await;
        }
    };

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamOutcome::ClientDisconnected,
            next = chunks.next() => next,
        };
        let chunk = match next {
            None => break StreamOutcome::Delivered,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                // Partial output already reached the client; it stands.
                debug!(error = %e, "upstream stream ended early");
                break StreamOutcome::Delivered;
            }
        };
        if let Some(usage) = chunk.usage {
            report.usage = Some(usage);
        }
        if let Some(reason) = chunk.finish_reason() {
            report.finish_reason = Some(reason.to_string());
        }
        match emitter.emit(&chunk).await {
            Ok(true) if report.first_byte_ms.is_none() => {
                report.first_byte_ms = Some(started.elapsed().as_millis() as u64);
            }
            Ok(_) => {}
            Err(_) => break StreamOutcome::ClientDisconnected,
        }
    };
    report.skipped = chunks.skipped();
    drop(chunks);

    if outcome == StreamOutcome::Delivered && emitter.finish().await.is_err() {
        return StreamOutcome::ClientDisconnected;
    }
    outcome
}

/// Append the error's diagnostic sentence to the committed body.
async fn degrade<S: ChunkSink>(
    emitter: &mut ChunkEmitter<S>,
    err: &RelayError,
    outcome: StreamOutcome,
) -> StreamOutcome {
    Span::current().record(telemetry::KEY_ERROR_KIND, err.kind());
    match emitter.diagnostic(&err.diagnostic()).await {
        Ok(()) => outcome,
        Err(_) => StreamOutcome::ClientDisconnected,
    }
}
