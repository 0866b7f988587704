//! Server-Sent-Events frame parser.
//!
//! [`FrameParser`] is a line-at-a-time state machine: `data:` lines accumulate
//! into the current event, a blank line flushes it. A flushed event is either
//! ignored (empty), terminal (`[DONE]`), or decoded as a [`DecodedChunk`].
//! Events whose JSON fails to decode are dropped on their own; they never end
//! the stream.
//!
//! [`FrameStream`] drives the parser from any stream of [`SseLine`]s and yields
//! decoded chunks until the sentinel, EOF, or a transport error.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::CoreResult;
use crate::http_client::SseLine;
use crate::model::DecodedChunk;

/// Literal payload that marks the end of an upstream stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// Result of flushing one event.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Chunk(DecodedChunk),
    Done,
}

#[derive(Debug, Default)]
pub struct FrameParser {
    data: Vec<String>,
    skipped: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line with its terminator already removed.
    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.flush();
        }
        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            self.data.push(rest.trim().to_string());
        }
        // id:, event:, retry: and ':' comments carry nothing we relay.
        None
    }

    /// Upstream closed: flush whatever is still buffered.
    pub fn finish(&mut self) -> Option<Frame> {
        self.flush()
    }

    /// Number of events dropped because their payload was not valid JSON.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn flush(&mut self) -> Option<Frame> {
        if self.data.is_empty() {
            return None;
        }
        let joined = self.data.join("\n");
        self.data.clear();
        let payload = joined.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == DONE_SENTINEL {
            return Some(Frame::Done);
        }
        match serde_json::from_str::<DecodedChunk>(payload) {
            Ok(chunk) => Some(Frame::Chunk(chunk)),
            Err(e) => {
                self.skipped += 1;
                debug!(error = %e, len = payload.len(), "dropping undecodable event");
                None
            }
        }
    }
}

/// Lazily decodes chunks out of a line stream. Finite and not restartable:
/// once it returns `None` it stays exhausted.
pub struct FrameStream<S> {
    lines: S,
    parser: FrameParser,
    done: bool,
}

impl<S> FrameStream<S>
where
    S: Stream<Item = CoreResult<SseLine>> + Unpin,
{
    pub fn new(lines: S) -> Self {
        Self {
            lines,
            parser: FrameParser::new(),
            done: false,
        }
    }

    pub fn skipped(&self) -> u64 {
        self.parser.skipped()
    }
}

impl<S> Stream for FrameStream<S>
where
    S: Stream<Item = CoreResult<SseLine>> + Unpin,
{
    type Item = CoreResult<DecodedChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            match this.lines.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(line))) => match this.parser.push_line(&line.line) {
                    Some(Frame::Chunk(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                    Some(Frame::Done) => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                    None => continue,
                },
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return match this.parser.finish() {
                        Some(Frame::Chunk(chunk)) => Poll::Ready(Some(Ok(chunk))),
                        _ => Poll::Ready(None),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
