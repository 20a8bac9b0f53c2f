use std::time::Duration;

use crate::speedtest::download::{DOWNLOAD_LIMITS, RANGE_DOWNLOAD_LIMITS};
use crate::speedtest::geo::Coordinates;
use crate::speedtest::ping::DEFAULT_LATENCY_SAMPLES;
use crate::speedtest::prober::ProbeLimits;
use crate::speedtest::select::{SelectionMode, DEFAULT_MAX_CLOSE_SERVERS};
use crate::speedtest::server::ServerId;
use crate::speedtest::upload::UPLOAD_LIMITS;

/// Everything a test session needs, passed in explicitly.
#[derive(Debug, Clone)]
pub struct Settings {
    pub origin: Coordinates,
    pub server_id: Option<ServerId>,
    pub latency_samples: usize,
    pub latency_timeout: Duration,
    pub max_close_servers: usize,
    pub download: ProbeLimits,
    pub range_download: ProbeLimits,
    pub upload: ProbeLimits,
    /// When set, download runs range-style against these instead of the
    /// selected server's images.
    pub range_targets: Vec<String>,
    pub run_download: bool,
    pub run_upload: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            origin: Coordinates::default(),
            server_id: None,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
            latency_timeout: Duration::from_secs(5),
            max_close_servers: DEFAULT_MAX_CLOSE_SERVERS,
            download: DOWNLOAD_LIMITS,
            range_download: RANGE_DOWNLOAD_LIMITS,
            upload: UPLOAD_LIMITS,
            range_targets: Vec::new(),
            run_download: true,
            run_upload: true,
        }
    }
}

impl Settings {
    pub fn selection_mode(&self) -> SelectionMode {
        match self.server_id {
            Some(id) => SelectionMode::Explicit(id),
            None => SelectionMode::Closest {
                max_close: self.max_close_servers,
            },
        }
    }

    pub fn download_limits(&self) -> ProbeLimits {
        if self.range_targets.is_empty() {
            self.download
        } else {
            self.range_download
        }
    }

    pub fn with_download_time(mut self, max: Duration) -> Self {
        self.download.max_duration = max;
        self.range_download.max_duration = max;
        self
    }

    pub fn with_upload_time(mut self, max: Duration) -> Self {
        self.upload.max_duration = max;
        self
    }
}
