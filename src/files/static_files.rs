//! Handler serving files below a web root.
//!
//! The request path is resolved against the canonical root; directories map
//! to their `index.html`. Anything that resolves outside the root is refused.
//! Files are sent with a `Content-Length` and streamed in fixed-size chunks.
//!
//! Every failure before the response head is written becomes
//! `400 Could not open path <path>: <reason>`.

use std::io;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::{HeaderMap, StatusCode};

use crate::error::{Error, Result};
use crate::http::handler::Handler;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::streaming::StreamingWriter;

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    chunk_size: usize,
}

impl StaticFiles {
    /// Serve files below `web_root`, which must exist.
    pub fn new(web_root: impl AsRef<Path>, chunk_size: usize) -> io::Result<Self> {
        Ok(Self {
            root: std::fs::canonicalize(web_root)?,
            chunk_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto a file below the root.
    pub async fn resolve(&self, request_path: &str) -> io::Result<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        let mut path = tokio::fs::canonicalize(self.root.join(relative)).await?;
        if tokio::fs::metadata(&path).await?.is_dir() {
            path.push(INDEX_FILE);
        }
        if !path.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path must be within root path",
            ));
        }
        Ok(path)
    }

    async fn open(&self, request_path: &str) -> io::Result<(tokio::fs::File, u64)> {
        let path = self.resolve(request_path).await?;
        let file = tokio::fs::File::open(&path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        Ok((file, metadata.len()))
    }

    /// Stream the file named by `request.path` into `response`.
    pub async fn serve(&self, request: &Request, response: &mut Response<'_>) -> Result<()> {
        let (file, length) = self.open(&request.path).await.map_err(|e| {
            Error::bad_request(format!("Could not open path {}: {}", request.path, e))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        response.write_head(StatusCode::OK, headers)?;

        let sent = StreamingWriter::new(file, self.chunk_size)
            .run(response)
            .await?;
        tracing::debug!(path = %request.path, bytes = sent, "File sent");
        Ok(())
    }
}

impl Handler for StaticFiles {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response<'_>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.serve(request, response))
    }
}
