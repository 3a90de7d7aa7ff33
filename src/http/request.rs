//! Request type and the bounded HTTP/1.x request reader.
//!
//! # Responsibilities
//! - Parse request line and headers off the connection buffer
//! - Read a Content-Length or chunked body into memory
//! - Reject anything larger than the configured streambuf limit
//! - Leave pipelined bytes buffered for the next request
//!
//! Headers are parsed with `httparse`; header and body limits are checked
//! before bytes are copied out of the connection buffer.

use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::net::connection::Connection;

/// Upper bound on header lines in one request.
pub const MAX_HEADERS: usize = 64;

/// Unique id attached to every request for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One parsed request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub method: Method,
    /// Path component of the target, without the query string.
    pub path: String,
    /// Everything after the first `?`, empty if absent.
    pub query_string: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_endpoint: Option<SocketAddr>,
}

impl Request {
    /// Whether the connection may carry another request after this one.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let has = |token: &str| {
            connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        match self.version {
            Version::HTTP_10 => has("keep-alive"),
            _ => !has("close"),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded `key=value` pairs of the query string.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query_string.as_bytes())
            .into_owned()
            .collect()
    }

    /// Decoded `application/x-www-form-urlencoded` body pairs.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }
}

/// Request line and headers, before the body has been read.
#[derive(Debug)]
struct Head {
    method: Method,
    path: String,
    query_string: String,
    version: Version,
    headers: HeaderMap,
}

enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

/// Read one complete request from `conn`.
///
/// Returns [`Error::ConnectionClosed`] when the peer closes cleanly before
/// sending any byte of a new request.
pub async fn read_request<S>(conn: &mut Connection<S>, max_size: usize) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (head, head_len) = loop {
        if let Some(parsed) = parse_head(conn.buffered())? {
            break parsed;
        }
        if conn.buffered().len() > max_size {
            return Err(Error::PayloadTooLarge { limit: max_size });
        }
        if conn.fill_buf().await? == 0 {
            return Err(if conn.buffered().is_empty() {
                Error::ConnectionClosed
            } else {
                Error::Io(std::io::ErrorKind::UnexpectedEof.into())
            });
        }
    };
    if head_len > max_size {
        return Err(Error::PayloadTooLarge { limit: max_size });
    }
    conn.advance(head_len);

    let body = match framing(&head.headers)? {
        Framing::Empty => Bytes::new(),
        Framing::Length(len) => {
            if len > max_size.saturating_sub(head_len) {
                return Err(Error::PayloadTooLarge { limit: max_size });
            }
            while conn.buffered().len() < len {
                if conn.fill_buf().await? == 0 {
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
            conn.consume(len).freeze()
        }
        Framing::Chunked => {
            let mut decoder = ChunkedDecoder::new(max_size.saturating_sub(head_len));
            loop {
                let used = decoder.decode(conn.buffered())?;
                conn.advance(used);
                if decoder.is_done() {
                    break decoder.into_body();
                }
                // Unterminated size lines, extensions and trailers count too.
                if head_len + decoder.consumed() + conn.buffered().len() > max_size {
                    return Err(Error::PayloadTooLarge { limit: max_size });
                }
                if conn.fill_buf().await? == 0 {
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
    };

    Ok(Request {
        id: RequestId::new(),
        method: head.method,
        path: head.path,
        query_string: head.query_string,
        version: head.version,
        headers: head.headers,
        body,
        remote_endpoint: conn.peer_addr(),
    })
}

fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::Parse(e.to_string())),
    };

    let method = req
        .method
        .ok_or_else(|| Error::Parse("missing method".into()))
        .and_then(|m| {
            Method::from_bytes(m.as_bytes()).map_err(|e| Error::Parse(e.to_string()))
        })?;
    let target = req
        .path
        .ok_or_else(|| Error::Parse("missing request target".into()))?;
    let (path, query_string) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::Parse(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|e| Error::Parse(e.to_string()))?;
        headers.append(name, value);
    }

    Ok(Some((
        Head {
            method,
            path,
            query_string,
            version,
            headers,
        },
        len,
    )))
}

fn framing(headers: &HeaderMap) -> Result<Framing> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }
    match headers.get(CONTENT_LENGTH) {
        None => Ok(Framing::Empty),
        Some(value) => {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| Error::Parse("invalid Content-Length".into()))?;
            Ok(if len == 0 {
                Framing::Empty
            } else {
                Framing::Length(len)
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental chunked body decoder.
///
/// Each call consumes whatever complete pieces sit at the front of the
/// buffer, so bytes are parsed and copied once however the body arrives.
#[derive(Debug)]
struct ChunkedDecoder {
    state: ChunkState,
    body: BytesMut,
    /// Decoded body limit.
    limit: usize,
    /// Wire bytes consumed so far.
    consumed: usize,
}

impl ChunkedDecoder {
    fn new(limit: usize) -> Self {
        Self {
            state: ChunkState::Size,
            body: BytesMut::new(),
            limit,
            consumed: 0,
        }
    }

    /// Decode from the front of `buf`, returning how many bytes were used.
    fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        let mut pos = 0;
        loop {
            let rest = &buf[pos..];
            match self.state {
                ChunkState::Size => {
                    let (skip, size) = match httparse::parse_chunk_size(rest) {
                        Ok(httparse::Status::Complete(parsed)) => parsed,
                        Ok(httparse::Status::Partial) => break,
                        Err(_) => return Err(Error::Parse("invalid chunk size".into())),
                    };
                    pos += skip;
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                        continue;
                    }
                    let size = usize::try_from(size)
                        .map_err(|_| Error::PayloadTooLarge { limit: self.limit })?;
                    if self.body.len().saturating_add(size) > self.limit {
                        return Err(Error::PayloadTooLarge { limit: self.limit });
                    }
                    self.body.reserve(size);
                    self.state = ChunkState::Data(size);
                }
                ChunkState::Data(remaining) => {
                    let n = remaining.min(rest.len());
                    if n == 0 {
                        break;
                    }
                    self.body.put_slice(&rest[..n]);
                    pos += n;
                    self.state = if n == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - n)
                    };
                }
                ChunkState::DataEnd => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(Error::Parse("chunk not terminated by CRLF".into()));
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // Header lines until an empty line.
                    let Some(eol) = find_crlf(rest) else {
                        break;
                    };
                    pos += eol + 2;
                    if eol == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
        }
        self.consumed += pos;
        Ok(pos)
    }

    fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    fn consumed(&self) -> usize {
        self.consumed
    }

    fn into_body(self) -> Bytes {
        self.body.freeze()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::guard::HandlerRunner;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn parse(raw: &[u8], max: usize) -> Result<Request> {
        let runner = HandlerRunner::new();
        let (mut client, server) = duplex(raw.len().max(1) * 2);
        let mut conn = Connection::new(server, &runner);
        client.write_all(raw).await.unwrap();
        drop(client);
        read_request(&mut conn, max).await
    }

    #[tokio::test]
    async fn parses_request_line_and_query() {
        let req = parse(b"GET /index.html?a=1&b=two%20words HTTP/1.1\r\nHost: x\r\n\r\n", 1024)
            .await
            .unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.query_string, "a=1&b=two%20words");
        assert_eq!(req.version, Version::HTTP_11);
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.body.is_empty());
        assert_eq!(
            req.query_pairs(),
            vec![("a".into(), "1".into()), ("b".into(), "two words".into())]
        );
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let req = parse(
            b"POST /calc HTTP/1.1\r\nContent-Length: 12\r\n\r\nexpr=1%2B2&x",
            1024,
        )
        .await
        .unwrap();
        assert_eq!(&req.body[..], b"expr=1%2B2&x");
        assert_eq!(req.form_pairs()[0], ("expr".into(), "1+2".into()));
    }

    #[tokio::test]
    async fn decodes_chunked_body_with_trailers() {
        let req = parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: y\r\n\r\n",
            1024,
        )
        .await
        .unwrap();
        assert_eq!(&req.body[..], b"hello world");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_reading_it() {
        let err = parse(
            b"POST / HTTP/1.1\r\nContent-Length: 5000\r\n\r\n",
            256,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit: 256 }));
    }

    #[tokio::test]
    async fn oversized_chunked_body_is_rejected() {
        let err = parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n20\r\n0123456789abcdef0123456789abcdef\r\n0\r\n\r\n",
            64,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn unterminated_trailer_hits_the_buffer_limit() {
        let mut raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(64 * 1024));
        let err = parse(&raw, 1024).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn unterminated_chunk_extension_hits_the_buffer_limit() {
        let mut raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;x=".to_vec();
        raw.extend(std::iter::repeat(b'a').take(64 * 1024));
        let err = parse(&raw, 1024).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit: 1024 }));
    }

    #[test]
    fn chunked_decoder_resumes_across_partial_input() {
        let wire = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: y\r\n\r\nGET";
        let mut decoder = ChunkedDecoder::new(1024);
        let mut pending: Vec<u8> = Vec::new();
        for &byte in wire.iter() {
            pending.push(byte);
            let used = decoder.decode(&pending).unwrap();
            pending.drain(..used);
            if decoder.is_done() {
                break;
            }
        }
        assert!(decoder.is_done());
        assert_eq!(decoder.consumed(), wire.len() - 3);
        assert_eq!(&decoder.into_body()[..], b"hello world");
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(512));
        let err = parse(&raw, 128).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit: 128 }));
    }

    #[tokio::test]
    async fn malformed_request_line_is_a_parse_error() {
        let err = parse(b"NOT A REQUEST\r\n\r\n", 1024).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn clean_close_is_reported_as_closed() {
        let err = parse(b"", 1024).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        let err = parse(b"GET / HT", 1024).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn pipelined_requests_stay_buffered() {
        let runner = HandlerRunner::new();
        let (mut client, server) = duplex(1024);
        let mut conn = Connection::new(server, &runner);
        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let first = read_request(&mut conn, 1024).await.unwrap();
        let second = read_request(&mut conn, 1024).await.unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
        assert!(conn.buffered().is_empty());
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        let mut req = Request {
            id: RequestId::new(),
            method: Method::GET,
            path: "/".into(),
            query_string: String::new(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_endpoint: None,
        };
        assert!(req.keep_alive());

        req.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!req.keep_alive());

        req.version = Version::HTTP_10;
        req.headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        assert!(req.keep_alive());

        req.headers.remove(CONNECTION);
        assert!(!req.keep_alive());
    }
}
