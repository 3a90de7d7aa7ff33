//! Chunked transfer of a readable source into a response.
//!
//! A chunk is read until the buffer is full or the source ends, then sent.
//! The next read starts only after the previous send resolved, so at most one
//! chunk is in flight per connection and memory stays bounded by the buffer
//! capacity no matter how large the source is.
//!
//! A short chunk means end of source and the transfer stops without another
//! read. A failed send ends the transfer; nothing is retried.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::observability::metrics;

/// Default buffer capacity for file transfers.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Destination for streamed chunks.
pub trait ChunkSink {
    /// Hand `chunk` to the wire. Resolves once it has been flushed.
    fn send_chunk<'a>(&'a mut self, chunk: &'a [u8])
        -> impl Future<Output = Result<()>> + Send + 'a;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A full chunk went out; the source may have more.
    Continue,
    Exhausted,
}

pub struct StreamingWriter<R> {
    source: R,
    buffer: Box<[u8]>,
    chunks_sent: usize,
    bytes_sent: u64,
    exhausted: bool,
}

impl<R> StreamingWriter<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(source: R, capacity: usize) -> Self {
        Self {
            source,
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            chunks_sent: 0,
            bytes_sent: 0,
            exhausted: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Read and send one chunk.
    pub async fn advance<K>(&mut self, sink: &mut K) -> Result<Progress>
    where
        K: ChunkSink + Send,
    {
        if self.exhausted {
            return Ok(Progress::Exhausted);
        }

        let filled = match fill(&mut self.source, &mut self.buffer).await {
            Ok(n) => n,
            Err(e) => {
                self.exhausted = true;
                return Err(e.into());
            }
        };
        if filled == 0 {
            self.exhausted = true;
            return Ok(Progress::Exhausted);
        }

        if let Err(e) = sink.send_chunk(&self.buffer[..filled]).await {
            self.exhausted = true;
            return Err(e);
        }
        self.chunks_sent += 1;
        self.bytes_sent += filled as u64;

        if filled < self.buffer.len() {
            self.exhausted = true;
            Ok(Progress::Exhausted)
        } else {
            Ok(Progress::Continue)
        }
    }

    /// Stream the whole source. Returns the number of bytes sent.
    pub async fn run<K>(mut self, sink: &mut K) -> Result<u64>
    where
        K: ChunkSink + Send,
    {
        loop {
            match self.advance(sink).await {
                Ok(Progress::Continue) => {}
                Ok(Progress::Exhausted) => break,
                Err(e) => {
                    tracing::debug!(
                        bytes_sent = self.bytes_sent,
                        error = %e,
                        "Stream interrupted"
                    );
                    metrics::streamed_bytes(self.bytes_sent);
                    return Err(e);
                }
            }
        }
        metrics::streamed_bytes(self.bytes_sent);
        Ok(self.bytes_sent)
    }
}

/// Read until `buf` is full or the source reports end of stream.
async fn fill<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
