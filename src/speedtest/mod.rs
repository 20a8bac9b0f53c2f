pub mod client;
pub mod download;
pub mod error;
pub mod geo;
pub mod ping;
pub mod prober;
pub mod scope;
pub mod select;
pub mod server;
pub mod throughput;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ProbeError;

#[derive(Debug, Clone, Default)]
pub struct SpeedTestResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Idle,
    Selecting,
    Download,
    Upload,
    Complete,
}
