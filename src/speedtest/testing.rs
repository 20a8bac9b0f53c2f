//! Scripted in-memory `HttpClient` for unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::client::{HttpClient, ResponseBody, UploadBody};
use super::error::ProbeError;

#[derive(Debug, Clone, Default)]
pub struct Script {
    size: u64,
    chunk: u64,
    chunk_delay: Duration,
    latency: Duration,
    fail_after: Option<u64>,
    refuse: bool,
}

impl Script {
    pub fn body(size: u64) -> Self {
        Self {
            size,
            chunk: 4096,
            ..Self::default()
        }
    }

    pub fn chunked(mut self, chunk: u64) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Delay before the response is returned.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails with a reset after this many bytes, read or sent.
    pub fn fail_after(mut self, bytes: u64) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    /// Fails the request before any byte moves.
    pub fn refuse(mut self) -> Self {
        self.refuse = true;
        self
    }
}

pub struct FakeClient {
    default: Script,
    routes: Vec<(String, Script)>,
    refuse_from: Option<usize>,
    latencies: Vec<Duration>,
    requests: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            routes: Vec::new(),
            refuse_from: None,
            latencies: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Uses `script` for every URL containing `pattern`.
    pub fn route(mut self, pattern: &str, script: Script) -> Self {
        self.routes.push((pattern.to_string(), script));
        self
    }

    /// Refuses the `n`th request (zero based) and every one after it.
    pub fn refuse_from(mut self, n: usize) -> Self {
        self.refuse_from = Some(n);
        self
    }

    /// Request `i` (zero based) takes `latencies[i]` instead of its
    /// script's latency.
    pub fn latencies(mut self, latencies: Vec<Duration>) -> Self {
        self.latencies = latencies;
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn script_for(&self, url: &str) -> Script {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(url.to_string());
            requests.len() - 1
        };
        let script = self
            .routes
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.default.clone());
        let script = match self.latencies.get(index) {
            Some(&latency) => script.latency(latency),
            None => script,
        };
        if self.refuse_from.is_some_and(|n| index >= n) {
            script.refuse()
        } else {
            script
        }
    }

    async fn respond(&self, url: &str, script: Script) -> Result<Box<dyn ResponseBody>, ProbeError> {
        tokio::time::sleep(script.latency).await;
        if script.refuse {
            return Err(ProbeError::transfer(url, "connection refused"));
        }
        Ok(Box::new(FakeBody {
            url: url.to_string(),
            remaining: script.size,
            read: 0,
            script,
        }))
    }
}

#[async_trait]
impl HttpClient for FakeClient {
    async fn get(&self, url: &str) -> Result<Box<dyn ResponseBody>, ProbeError> {
        let script = self.script_for(url);
        self.respond(url, script).await
    }

    async fn post(
        &self,
        url: &str,
        _content_type: &str,
        body: UploadBody,
    ) -> Result<Box<dyn ResponseBody>, ProbeError> {
        let script = self.script_for(url);
        let sent = body.sent_counter();
        for _ in body.into_chunks() {
            if !script.chunk_delay.is_zero() {
                tokio::time::sleep(script.chunk_delay).await;
            }
            let total = sent.load(std::sync::atomic::Ordering::Relaxed);
            if script.fail_after.is_some_and(|limit| total >= limit) {
                return Err(ProbeError::transfer(url, "connection reset"));
            }
        }
        self.respond(url, script).await
    }
}

struct FakeBody {
    url: String,
    remaining: u64,
    read: u64,
    script: Script,
}

#[async_trait]
impl ResponseBody for FakeBody {
    async fn read_chunk(&mut self) -> Result<Option<usize>, ProbeError> {
        if self.script.fail_after.is_some_and(|limit| self.read >= limit) {
            return Err(ProbeError::transfer(&self.url, "connection reset"));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        if !self.script.chunk_delay.is_zero() {
            tokio::time::sleep(self.script.chunk_delay).await;
        }
        let mut n = self.script.chunk.min(self.remaining);
        if let Some(limit) = self.script.fail_after {
            n = n.min(limit - self.read);
        }
        self.remaining -= n;
        self.read += n;
        Ok(Some(n as usize))
    }
}
