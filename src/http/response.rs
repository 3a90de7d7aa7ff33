//! Response sink handed to handlers.
//!
//! # Responsibilities
//! - Buffer the status line and headers, written exactly once
//! - Buffer body bytes until [`Response::send`] flushes them
//! - Track whether the body length is declared or delimited by close
//! - Decide whether the connection can carry another request afterwards
//!
//! Writes before any head imply `200 OK` without a length, which means the
//! connection closes once the response completes.

use std::future::Future;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH};
use hyper::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Operation, Result};
use crate::http::streaming::ChunkSink;

/// How the connection proceeds once a response is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Read the next request on the same connection.
    KeepAlive,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    Pending,
    Buffered,
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    Known(u64),
    /// Delimited by closing the connection.
    UntilClose,
}

pub struct Response<'c> {
    writer: &'c mut (dyn AsyncWrite + Unpin + Send),
    write_timeout: Duration,
    keep_alive: bool,
    version: Version,
    head: HeadState,
    status: StatusCode,
    length: BodyLength,
    pending: BytesMut,
    body_written: u64,
}

impl<'c> Response<'c> {
    pub fn new(
        writer: &'c mut (dyn AsyncWrite + Unpin + Send),
        version: Version,
        keep_alive: bool,
        write_timeout: Duration,
    ) -> Self {
        Self {
            writer,
            write_timeout,
            keep_alive,
            version,
            head: HeadState::Pending,
            status: StatusCode::OK,
            length: BodyLength::UntilClose,
            pending: BytesMut::new(),
            body_written: 0,
        }
    }

    /// Queue the status line and headers.
    ///
    /// A `Content-Length` header declares the body length; without it the
    /// body runs until the connection closes.
    pub fn write_head(&mut self, status: StatusCode, mut headers: HeaderMap) -> Result<()> {
        if self.head != HeadState::Pending {
            return Err(Error::HeadersAlreadyWritten);
        }

        self.length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(BodyLength::UntilClose, BodyLength::Known);
        if self.length == BodyLength::UntilClose {
            self.keep_alive = false;
        }

        if !self.keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if self.version == Version::HTTP_10 {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        let mut head = BytesMut::with_capacity(128);
        head.put_slice(b"HTTP/1.1 ");
        head.put_slice(status.as_str().as_bytes());
        head.put_u8(b' ');
        head.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
        head.put_slice(b"\r\n");
        for (name, value) in headers.iter() {
            head.put_slice(name.as_str().as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");

        // Body bytes are never queued before the head.
        debug_assert!(self.pending.is_empty());
        self.pending = head;
        self.status = status;
        self.head = HeadState::Buffered;
        Ok(())
    }

    /// Queue body bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        if self.head == HeadState::Pending {
            // Infallible: the head has not been written yet.
            let _ = self.write_head(StatusCode::OK, HeaderMap::new());
        }
        self.pending.put_slice(bytes);
        self.body_written += bytes.len() as u64;
    }

    /// Queue a complete short response with a plain-text message body.
    pub fn write_status(&mut self, status: StatusCode, message: impl AsRef<str>) -> Result<()> {
        let message = message.as_ref();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len()));
        self.write_head(status, headers)?;
        self.write(message.as_bytes());
        Ok(())
    }

    /// Flush everything queued so far. Resolves once the bytes have left
    /// for the wire, bounded by the write timeout.
    pub async fn send(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let timeout = self.write_timeout;
        let write = async {
            self.writer.write_all(&self.pending).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: Operation::WriteResponse,
                    timeout,
                })
            }
        }
        crate::observability::metrics::bytes_sent(self.pending.len());
        self.pending.clear();
        self.head = HeadState::Flushed;
        Ok(())
    }

    /// Whether the status line has left for the wire.
    pub fn headers_sent(&self) -> bool {
        self.head == HeadState::Flushed
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Body bytes queued or sent so far.
    pub fn body_written(&self) -> u64 {
        self.body_written
    }

    /// Discard anything not yet flushed. Returns `false` if the head was
    /// already sent, in which case nothing can be replaced.
    pub(crate) fn reset(&mut self) -> bool {
        if self.headers_sent() {
            return false;
        }
        self.pending.clear();
        self.head = HeadState::Pending;
        self.status = StatusCode::OK;
        self.length = BodyLength::UntilClose;
        self.body_written = 0;
        true
    }

    /// Flush the remainder and decide what happens to the connection.
    pub(crate) async fn finish(mut self) -> Result<Completion> {
        if self.head == HeadState::Pending {
            tracing::warn!("Handler produced no response; closing connection");
            return Ok(Completion::Close);
        }
        self.send().await?;
        match self.length {
            BodyLength::Known(len) if self.keep_alive && len == self.body_written => {
                Ok(Completion::KeepAlive)
            }
            BodyLength::Known(len) => {
                if len != self.body_written {
                    tracing::warn!(
                        declared = len,
                        written = self.body_written,
                        "Body length mismatch; closing connection"
                    );
                }
                Ok(Completion::Close)
            }
            BodyLength::UntilClose => Ok(Completion::Close),
        }
    }
}

impl ChunkSink for Response<'_> {
    fn send_chunk<'a>(&'a mut self, chunk: &'a [u8]) -> impl Future<Output = Result<()>> + Send + 'a {
        async move {
            self.write(chunk);
            self.send().await
        }
    }
}
