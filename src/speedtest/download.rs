use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use super::client::{HttpClient, UploadBody};
use super::error::ProbeError;
use super::prober::{Collected, ProbeLimits, ProberGroup, Transfer};
use super::scope::Scope;
use super::server::Server;
use super::throughput::ProbeProgress;

pub const DOWNLOAD_LIMITS: ProbeLimits = ProbeLimits {
    concurrency: 6,
    max_duration: Duration::from_secs(10),
};

/// Range endpoints are cheap per request, so more of them run at once.
pub const RANGE_DOWNLOAD_LIMITS: ProbeLimits = ProbeLimits {
    concurrency: 12,
    max_duration: Duration::from_secs(10),
};

const DOWNLOAD_REPEATS: usize = 5;

/// Edge length in pixels of the square random images.
const IMAGE_SIZES: [u32; 10] = [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];

/// Byte counts requested from range endpoints.
const RANGE_SIZES: [u64; 10] = [
    256, 512, 1024, 2048, 4096, 131_072, 1_048_576, 4_194_304, 8_388_608, 16_777_216,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Get,
    /// Range endpoints answer an empty POST.
    EmptyPost,
}

/// One download attempt. Owns its URL so every queued task is independent.
pub struct DownloadTask {
    client: Arc<dyn HttpClient>,
    url: String,
    fetch: Fetch,
    scope: Scope,
}

impl DownloadTask {
    /// Reads the whole response, counting bytes until end of data, a read
    /// error, or the scope finishing. Bytes already read are always kept.
    pub async fn run(self) -> Transfer {
        if let Some(err) = self.scope.err() {
            return Transfer::failed(0, err);
        }

        let response = match self.fetch {
            Fetch::Get => self.scope.guard(self.client.get(&self.url)).await,
            Fetch::EmptyPost => {
                self.scope
                    .guard(self.client.post(&self.url, "", UploadBody::empty()))
                    .await
            }
        };
        let mut body = match response {
            Ok(body) => body,
            Err(err) => return Transfer::failed(0, err),
        };

        let mut bytes = 0u64;
        loop {
            match self.scope.guard(body.read_chunk()).await {
                Ok(Some(n)) => bytes += n as u64,
                Ok(None) => return Transfer::complete(bytes),
                Err(err) => return Transfer::failed(bytes, err),
            }
        }
    }
}

pub fn image_url(server: &Server, size: u32) -> String {
    server.relative_url(&format!("random{size}x{size}.jpg"))
}

/// Appends `/range/0-{size}` to the target's path as is, so a path ending
/// in `/` gets a doubled slash. An unparseable target is returned as is and
/// fails at the transfer.
pub fn range_url(target: &str, size: u64) -> String {
    match Url::parse(target) {
        Ok(mut url) => {
            let path = format!("{}/range/0-{}", url.path(), size);
            url.set_path(&path);
            url.into()
        }
        Err(e) => {
            debug!(target, "cannot add range to target: {}", e);
            target.to_string()
        }
    }
}

/// Image-style download probe against one server.
pub async fn probe_download(
    client: Arc<dyn HttpClient>,
    server: &Server,
    limits: ProbeLimits,
    scope: &Scope,
    progress: Option<mpsc::Sender<ProbeProgress>>,
) -> Result<Collected, ProbeError> {
    let urls = IMAGE_SIZES
        .iter()
        .flat_map(|&size| std::iter::repeat(image_url(server, size)).take(DOWNLOAD_REPEATS));
    run_probe(client, urls, Fetch::Get, limits, scope, progress).await
}

/// Range-style download probe spread over every target.
pub async fn probe_range_download(
    client: Arc<dyn HttpClient>,
    targets: &[String],
    limits: ProbeLimits,
    scope: &Scope,
    progress: Option<mpsc::Sender<ProbeProgress>>,
) -> Result<Collected, ProbeError> {
    let mut urls = Vec::with_capacity(RANGE_SIZES.len() * DOWNLOAD_REPEATS * targets.len());
    for &size in &RANGE_SIZES {
        for _ in 0..DOWNLOAD_REPEATS {
            urls.extend(targets.iter().map(|t| range_url(t, size)));
        }
    }
    run_probe(client, urls, Fetch::EmptyPost, limits, scope, progress).await
}

async fn run_probe(
    client: Arc<dyn HttpClient>,
    urls: impl IntoIterator<Item = String>,
    fetch: Fetch,
    limits: ProbeLimits,
    scope: &Scope,
    progress: Option<mpsc::Sender<ProbeProgress>>,
) -> Result<Collected, ProbeError> {
    let scope = scope.child_with_timeout(limits.max_duration);
    let mut group = ProberGroup::new(limits.concurrency, scope.clone())?;

    for url in urls {
        let task = DownloadTask {
            client: Arc::clone(&client),
            url,
            fetch,
            scope: scope.clone(),
        };
        group.add(task.run());
    }

    let collected = group.collect_with(progress).await;
    scope.cancel();

    info!(
        completed = collected.completed,
        skipped = collected.skipped,
        bytes = collected.throughput.total_bytes,
        rate = %collected.rate().unwrap_or_default(),
        "download probe finished"
    );
    Ok(collected)
}
