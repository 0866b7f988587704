//! Downstream side of the relay: turns decoded chunks into body bytes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CoreResult, RelayError};
use crate::model::DecodedChunk;

/// When buffered text is pushed to the client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Flush after every non-empty fragment. Lowest latency.
    #[default]
    EveryChunk,
    /// Coalesce fragments until at least this many bytes are pending.
    Threshold(usize),
}

/// A committed response body. `write` may buffer; `flush` hands whatever is
/// pending to the transport. Both fail with [`RelayError::ClientGone`] once
/// the client has disconnected.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> CoreResult<()>;
    async fn flush(&mut self) -> CoreResult<()>;
}

#[async_trait]
impl<'a, S: ChunkSink + ?Sized> ChunkSink for &'a mut S {
    async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        (**self).write(bytes).await
    }

    async fn flush(&mut self) -> CoreResult<()> {
        (**self).flush().await
    }
}

/// Frames sent over this channel become the streaming HTTP body.
pub type BodyFrame = Result<Bytes, std::io::Error>;

/// [`ChunkSink`] backed by the sender half of a streaming response body.
pub struct BodySink {
    tx: mpsc::Sender<BodyFrame>,
    pending: BytesMut,
}

impl BodySink {
    pub fn new(tx: mpsc::Sender<BodyFrame>) -> Self {
        Self {
            tx,
            pending: BytesMut::new(),
        }
    }
}

#[async_trait]
impl ChunkSink for BodySink {
    async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        if self.tx.is_closed() {
            return Err(RelayError::ClientGone);
        }
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> CoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = self.pending.split().freeze();
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| RelayError::ClientGone)
    }
}

/// Running totals of what reached the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub chunks: u64,
    pub bytes: u64,
    pub flushes: u64,
}

pub struct ChunkEmitter<S> {
    sink: S,
    policy: FlushPolicy,
    unflushed: usize,
    stats: EmitStats,
}

impl<S: ChunkSink> ChunkEmitter<S> {
    pub fn new(sink: S, policy: FlushPolicy) -> Self {
        Self {
            sink,
            policy,
            unflushed: 0,
            stats: EmitStats::default(),
        }
    }

    /// Write the chunk's text, if any. Returns whether bytes were written.
    /// Chunks without choices or with empty content are skipped entirely.
    pub async fn emit(&mut self, chunk: &DecodedChunk) -> CoreResult<bool> {
        let text = chunk.content();
        if text.is_empty() {
            return Ok(false);
        }
        self.sink.write(text.as_bytes()).await?;
        self.unflushed += text.len();
        self.stats.chunks += 1;
        self.stats.bytes += text.len() as u64;
        let due = match self.policy {
            FlushPolicy::EveryChunk => true,
            FlushPolicy::Threshold(n) => self.unflushed >= n,
        };
        if due {
            self.flush().await?;
        }
        Ok(true)
    }

    /// Write a diagnostic sentence and flush it regardless of policy.
    pub async fn diagnostic(&mut self, text: &str) -> CoreResult<()> {
        self.sink.write(text.as_bytes()).await?;
        self.unflushed += text.len();
        self.flush().await
    }

    /// Push out anything the policy held back.
    pub async fn finish(&mut self) -> CoreResult<()> {
        self.flush().await
    }

    pub fn stats(&self) -> EmitStats {
        self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    async fn flush(&mut self) -> CoreResult<()> {
        if self.unflushed == 0 {
            return Ok(());
        }
        self.sink.flush().await?;
        self.unflushed = 0;
        self.stats.flushes += 1;
        Ok(())
    }
}
