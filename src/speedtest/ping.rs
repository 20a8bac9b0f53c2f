use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::client::HttpClient;
use super::error::ProbeError;
use super::scope::Scope;
use super::server::Server;

pub const DEFAULT_LATENCY_SAMPLES: usize = 10;

const LATENCY_PATH: &str = "latency.txt";

/// Anything that can rank a server by round-trip time.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Takes the configured number of samples. Any failed round trip fails
    /// the whole measurement.
    async fn measure(&self, server: &Server, scope: &Scope) -> Result<LatencyResult, ProbeError>;
}

/// Sequential round trips against a server's latency file.
pub struct LatencyProber {
    client: Arc<dyn HttpClient>,
    samples: usize,
    progress: Option<mpsc::Sender<Duration>>,
}

impl LatencyProber {
    pub fn new(client: Arc<dyn HttpClient>, samples: usize) -> Result<Self, ProbeError> {
        if samples == 0 {
            return Err(ProbeError::InvalidSetting {
                name: "latency samples",
                value: samples,
            });
        }
        Ok(Self {
            client,
            samples,
            progress: None,
        })
    }

    /// Pushes every sample to `tx` as it is taken.
    pub fn with_progress(mut self, tx: mpsc::Sender<Duration>) -> Self {
        self.progress = Some(tx);
        self
    }
}

#[async_trait]
impl LatencyProbe for LatencyProber {
    async fn measure(&self, server: &Server, scope: &Scope) -> Result<LatencyResult, ProbeError> {
        let url = server.relative_url(LATENCY_PATH);
        let mut samples = Vec::with_capacity(self.samples);

        for _ in 0..self.samples {
            let rtt = scope.guard(round_trip(self.client.as_ref(), &url)).await?;
            if let Some(tx) = &self.progress {
                let _ = tx.send(rtt).await;
            }
            samples.push(rtt);
        }

        let result = LatencyResult::from_samples(samples);
        debug!(server = %server.id, mean = ?result.mean(), "latency measured");
        Ok(result)
    }
}

async fn round_trip(client: &dyn HttpClient, url: &str) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    let mut body = client.get(url).await?;
    while body.read_chunk().await?.is_some() {}
    Ok(start.elapsed())
}

#[derive(Debug, Clone, Default)]
pub struct LatencyResult {
    samples: Vec<Duration>,
}

impl LatencyResult {
    pub fn from_samples(samples: Vec<Duration>) -> Self {
        Self { samples }
    }

    /// Arithmetic mean, `None` without samples.
    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// The mean as the server's latency. A result without samples cannot
    /// rank a server.
    pub fn average(&self) -> Result<Duration, ProbeError> {
        self.mean().ok_or(ProbeError::InvalidSetting {
            name: "latency samples",
            value: 0,
        })
    }

    /// Sample standard deviation.
    pub fn jitter(&self) -> Option<Duration> {
        let mean = self.mean()?.as_secs_f64();
        if self.samples.len() < 2 {
            return Some(Duration::ZERO);
        }
        let variance: f64 = self
            .samples
            .iter()
            .map(|s| (s.as_secs_f64() - mean).powi(2))
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        Some(Duration::from_secs_f64(variance.sqrt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::server::test_server;
    use crate::speedtest::testing::{FakeClient, Script};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_mean_is_exact() {
        let result = LatencyResult::from_samples(vec![ms(10), ms(20), ms(30)]);
        assert_eq!(result.mean(), Some(ms(20)));
    }

    #[test]
    fn test_empty_result_has_no_mean() {
        assert_eq!(LatencyResult::default().mean(), None);
        assert_eq!(LatencyResult::default().jitter(), None);
        assert!(matches!(
            LatencyResult::default().average(),
            Err(ProbeError::InvalidSetting { value: 0, .. })
        ));
    }

    #[test]
    fn test_jitter() {
        let result = LatencyResult::from_samples(vec![ms(10), ms(20), ms(30)]);
        let jitter = result.jitter().unwrap();
        assert!((jitter.as_secs_f64() - 0.010).abs() < 1e-6);

        let single = LatencyResult::from_samples(vec![ms(10)]);
        assert_eq!(single.jitter(), Some(Duration::ZERO));
    }

    #[test]
    fn test_zero_samples_rejected() {
        let client = Arc::new(FakeClient::new(Script::body(0)));
        assert!(matches!(
            LatencyProber::new(client, 0).err(),
            Some(ProbeError::InvalidSetting { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_sequential_round_trips() {
        let client = Arc::new(FakeClient::new(Script::body(16).latency(ms(20))));
        let (tx, mut rx) = mpsc::channel(8);
        let prober = LatencyProber::new(client.clone(), 3).unwrap().with_progress(tx);

        let started = Instant::now();
        let avg = prober
            .measure(&test_server(1, 0.0, 0.0), &Scope::new())
            .await
            .and_then(|r| r.average())
            .unwrap();

        assert!(avg >= ms(20));
        assert!(avg < ms(25));
        // Sequential, so the total is at least three round trips.
        assert!(started.elapsed() >= ms(60));

        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests
            .iter()
            .all(|u| u == "http://server1.example:8080/speedtest/latency.txt"));

        drop(prober);
        let mut seen = 0;
        while rx.recv().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_one_failed_sample_fails_measurement() {
        let client = Arc::new(FakeClient::new(Script::body(16)).refuse_from(2));
        let prober = LatencyProber::new(client.clone(), 5).unwrap();

        let res = prober.measure(&test_server(1, 0.0, 0.0), &Scope::new()).await;

        assert!(matches!(res, Err(ProbeError::Transfer { .. })));
        // Aborted at the failing sample.
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_measurement() {
        let client = Arc::new(FakeClient::new(Script::body(16).latency(Duration::from_secs(30))));
        let prober = LatencyProber::new(client, 3).unwrap();
        let scope = Scope::new().child_with_timeout(ms(30));

        let started = Instant::now();
        let res = prober.measure(&test_server(1, 0.0, 0.0), &scope).await;

        assert!(matches!(res, Err(ProbeError::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_of_measured_round_trips() {
        let client = Arc::new(
            FakeClient::new(Script::body(0)).latencies(vec![ms(10), ms(20), ms(30)]),
        );
        let prober = LatencyProber::new(client, 3).unwrap();

        let result = prober
            .measure(&test_server(1, 0.0, 0.0), &Scope::new())
            .await
            .unwrap();

        assert_eq!(result.average().unwrap(), ms(20));
        let jitter = result.jitter().unwrap();
        assert!((jitter.as_secs_f64() - 0.010).abs() < 1e-6);
    }
}
