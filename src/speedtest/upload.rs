use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::info;

use super::client::{HttpClient, UploadBody};
use super::error::ProbeError;
use super::prober::{Collected, ProbeLimits, ProberGroup, Transfer};
use super::scope::Scope;
use super::server::Server;
use super::throughput::ProbeProgress;

pub const UPLOAD_LIMITS: ProbeLimits = ProbeLimits {
    concurrency: 12,
    max_duration: Duration::from_secs(10),
};

const UPLOAD_REPEATS: usize = 5;
const UPLOAD_SIZES: [usize; 5] = [262_144, 524_288, 1_048_576, 2_097_152, 4_194_304];
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
const UPLOAD_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// One POST of `size` bytes from the shared payload.
pub struct UploadTask {
    client: Arc<dyn HttpClient>,
    url: String,
    payload: Arc<Vec<u8>>,
    size: usize,
    scope: Scope,
}

impl UploadTask {
    /// Counts bytes as the HTTP layer takes them, so a failed or cut-off
    /// upload still reports what was sent.
    pub async fn run(self) -> Transfer {
        if let Some(err) = self.scope.err() {
            return Transfer::failed(0, err);
        }

        let size = self.size.min(self.payload.len());
        let body = UploadBody::new(&self.payload[..size], UPLOAD_CHUNK_SIZE);
        let sent = body.sent_counter();

        let res = self
            .scope
            .guard(async {
                let mut response = self.client.post(&self.url, UPLOAD_CONTENT_TYPE, body).await?;
                while response.read_chunk().await?.is_some() {}
                Ok(())
            })
            .await;

        let bytes = sent.load(Ordering::Relaxed);
        match res {
            Ok(()) => Transfer::complete(bytes),
            Err(err) => Transfer::failed(bytes, err),
        }
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let rng = rand::rngs::StdRng::from_entropy();
    rng.sample_iter(&Alphanumeric).take(len).collect()
}

/// Upload probe against one server's upload URL.
pub async fn probe_upload(
    client: Arc<dyn HttpClient>,
    server: &Server,
    limits: ProbeLimits,
    scope: &Scope,
    progress: Option<mpsc::Sender<ProbeProgress>>,
) -> Result<Collected, ProbeError> {
    run_probe(client, &server.url, &UPLOAD_SIZES, limits, scope, progress).await
}

async fn run_probe(
    client: Arc<dyn HttpClient>,
    url: &str,
    sizes: &[usize],
    limits: ProbeLimits,
    scope: &Scope,
    progress: Option<mpsc::Sender<ProbeProgress>>,
) -> Result<Collected, ProbeError> {
    let len = sizes.iter().copied().max().unwrap_or(0);
    let payload = tokio::task::spawn_blocking(move || random_payload(len))
        .await
        .map_err(|e| ProbeError::TaskPanicked {
            message: e.to_string(),
        })?;
    let payload = Arc::new(payload);

    // The clock starts once the payload exists.
    let scope = scope.child_with_timeout(limits.max_duration);
    let mut group = ProberGroup::new(limits.concurrency, scope.clone())?;

    for &size in sizes {
        for _ in 0..UPLOAD_REPEATS {
            let task = UploadTask {
                client: Arc::clone(&client),
                url: url.to_string(),
                payload: Arc::clone(&payload),
                size,
                scope: scope.clone(),
            };
            group.add(task.run());
        }
    }

    let collected = group.collect_with(progress).await;
    scope.cancel();

    info!(
        completed = collected.completed,
        skipped = collected.skipped,
        bytes = collected.throughput.total_bytes,
        rate = %collected.rate().unwrap_or_default(),
        "upload probe finished"
    );
    Ok(collected)
}
