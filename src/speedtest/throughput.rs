//! Throughput aggregation: total bytes over wall-clock elapsed time.

use std::fmt;
use std::time::Duration;

/// Below this much elapsed time a rate is not meaningful.
pub const MIN_ELAPSED: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct BytesPerSecond(pub f64);

impl BytesPerSecond {
    pub fn mbps(self) -> f64 {
        self.0 * 8.0 / 1_000_000.0
    }
}

impl fmt::Display for BytesPerSecond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mbps = self.mbps();
        if mbps >= 1000.0 {
            write!(f, "{:.2} Gbps", mbps / 1000.0)
        } else if mbps >= 1.0 {
            write!(f, "{:.2} Mbps", mbps)
        } else {
            write!(f, "{:.0} Kbps", mbps * 1000.0)
        }
    }
}

/// Bytes moved by a set of overlapping transfers and the wall-clock span
/// from first dispatch to last completion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Throughput {
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl Throughput {
    /// `None` when too little time has passed to divide by.
    pub fn rate(&self) -> Option<BytesPerSecond> {
        if self.elapsed < MIN_ELAPSED {
            return None;
        }
        Some(BytesPerSecond(
            self.total_bytes as f64 / self.elapsed.as_secs_f64(),
        ))
    }

    pub fn add(&mut self, bytes: u64) {
        self.total_bytes = self.total_bytes.saturating_add(bytes);
    }
}

/// Running estimate pushed to a progress sink after each completed task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeProgress {
    pub rate: BytesPerSecond,
    pub total_bytes: u64,
    pub completed: usize,
    pub total: usize,
}

impl ProbeProgress {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }
}
