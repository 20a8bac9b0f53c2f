//! HTTP capability used by the probes, and its reqwest implementation.
//!
//! Callers race every call against their [`Scope`](super::scope::Scope);
//! dropping an in-flight future or body aborts the request and closes the
//! connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::ProbeError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Box<dyn ResponseBody>, ProbeError>;

    async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: UploadBody,
    ) -> Result<Box<dyn ResponseBody>, ProbeError>;
}

/// Readable response stream.
#[async_trait]
pub trait ResponseBody: Send {
    /// Reads the next chunk and returns its length, or `None` at end of data.
    async fn read_chunk(&mut self) -> Result<Option<usize>, ProbeError>;
}

/// Request payload split into chunks. The shared counter advances as the
/// HTTP layer pulls each chunk, so a body that is only partly sent still
/// reports what went out.
#[derive(Debug, Default)]
pub struct UploadBody {
    chunks: Vec<Vec<u8>>,
    sent: Arc<AtomicU64>,
}

impl UploadBody {
    pub fn new(data: &[u8], chunk_size: usize) -> Self {
        Self {
            chunks: data.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect(),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sent)
    }

    pub fn into_chunks(self) -> SentChunks {
        SentChunks {
            chunks: self.chunks.into_iter(),
            pending: 0,
            sent: self.sent,
        }
    }
}

/// Yields the body's chunks. A chunk counts as sent once the HTTP layer
/// comes back for the next one (or for the end of the body), so a transfer
/// cut off mid-chunk never counts the chunk still in flight.
#[derive(Debug)]
pub struct SentChunks {
    chunks: std::vec::IntoIter<Vec<u8>>,
    pending: u64,
    sent: Arc<AtomicU64>,
}

impl Iterator for SentChunks {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.sent
            .fetch_add(std::mem::take(&mut self.pending), Ordering::Relaxed);
        let chunk = self.chunks.next()?;
        self.pending = chunk.len() as u64;
        Some(chunk)
    }
}

/// Production client. `reqwest::Client` is internally reference counted and
/// safe to share across every concurrent task.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, ProbeError> {
        let inner = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProbeError::transfer("<client>", e))?;
        Ok(Self { inner })
    }

    fn finish(
        url: &str,
        res: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<Box<dyn ResponseBody>, ProbeError> {
        let res = res.map_err(|e| ProbeError::transfer(url, e))?;
        if !res.status().is_success() {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status: res.status().as_u16(),
            });
        }
        Ok(Box::new(ReqwestBody {
            url: url.to_string(),
            res,
        }))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<Box<dyn ResponseBody>, ProbeError> {
        let res = self.inner.get(url).send().await;
        Self::finish(url, res)
    }

    async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: UploadBody,
    ) -> Result<Box<dyn ResponseBody>, ProbeError> {
        let stream = futures::stream::iter(body.into_chunks().map(Ok::<_, std::io::Error>));
        let res = self
            .inner
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await;
        Self::finish(url, res)
    }
}

struct ReqwestBody {
    url: String,
    res: reqwest::Response,
}

#[async_trait]
impl ResponseBody for ReqwestBody {
    async fn read_chunk(&mut self) -> Result<Option<usize>, ProbeError> {
        match self.res.chunk().await {
            Ok(chunk) => Ok(chunk.map(|c| c.len())),
            Err(e) => Err(ProbeError::transfer(&self.url, e)),
        }
    }
}
