use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{Stream, StreamExt};
use reqwest::{Client, Response};
use serde::Serialize;
use tracing::debug;

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};

/// Request context carries the tracing id forwarded upstream.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

/// Size caps applied while reading an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub max_line_bytes: usize,
    pub error_excerpt_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 64 << 10,
            error_excerpt_bytes: 8 << 10,
        }
    }
}

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    /// Pooled client with a connect timeout only. No total timeout is set,
    /// since that would cut off long-running streams.
    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_millis(cfg.pool_idle_timeout_ms))
            .tcp_keepalive(Duration::from_millis(cfg.tcp_keepalive_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("chatrelay/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line with its `\n` / `\r\n` removed.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
        limits: ReadLimits,
    ) -> CoreResult<SseStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable {
                reason: describe_send_error(e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let excerpt = read_excerpt(resp, limits.error_excerpt_bytes).await;
            return Err(RelayError::UpstreamStatus {
                code: status.as_u16(),
                excerpt,
            });
        }

        let line_stream = LineStream::new(Box::pin(resp.bytes_stream()), limits.max_line_bytes);
        Ok(Box::pin(line_stream))
    }
}

fn describe_send_error(e: reqwest::Error) -> String {
    if e.is_connect() {
        "connect failed".into()
    } else if e.is_timeout() {
        "connect timed out".into()
    } else {
        // Display includes the URL, which may embed credentials in the userinfo.
        format!("request failed: {}", e.without_url())
    }
}

/// Read at most `cap` bytes of an error body. The rest is never pulled off
/// the socket; dropping the response releases the connection.
async fn read_excerpt(resp: Response, cap: usize) -> String {
    let mut buf: Vec<u8> = Vec::with_capacity(cap.min(4096));
    let mut body = resp.bytes_stream();
    while buf.len() < cap {
        match body.next().await {
            Some(Ok(chunk)) => {
                let room = cap - buf.len();
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            Some(Err(e)) => {
                debug!(error = %e, "error body read aborted");
                break;
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Internal line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
///
/// Works on raw bytes so multi-byte characters split across network chunks
/// survive intact. A line longer than `max_line` is cut to `max_line` bytes
/// and the remainder up to the next newline is discarded.
pub(crate) struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    max_line: usize,
    discarding: bool,
    finished: bool,
}

impl LineStream {
    pub(crate) fn new(inner: ByteStream, max_line: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line: max_line.max(1),
            discarding: false,
            finished: false,
        }
    }

    fn take_line(&mut self) -> Option<SseLine> {
        let idx = self.buf.iter().position(|b| *b == b'\n')?;
        let mut raw: Vec<u8> = self.buf.drain(..=idx).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Some(SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    fn absorb(&mut self, chunk: &[u8]) {
        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    chunk = &chunk[i..];
                    self.discarding = false;
                }
                None => return,
            }
        }
        self.buf.extend_from_slice(chunk);
    }

    fn cap_partial_line(&mut self) {
        if self.buf.len() > self.max_line {
            self.buf.truncate(self.max_line);
            self.discarding = true;
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // If we already have a newline in the buffer, split and yield immediately.
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            self.cap_partial_line();

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.absorb(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.buf.clear();
                    return Poll::Ready(Some(Err(RelayError::UpstreamUnavailable {
                        reason: format!("stream interrupted: {}", e.without_url()),
                    })));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if self.buf.is_empty() {
                        return Poll::Ready(None);
                    }
                    let raw = std::mem::take(&mut self.buf);
                    return Poll::Ready(Some(Ok(SseLine {
                        line: String::from_utf8_lossy(&raw).into_owned(),
                    })));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
