//! Bounded worker pool for probe transfers.
//!
//! Tasks are queued with [`ProberGroup::add`] and only start running once
//! the group is collected. At most `limit` long-lived workers pull from the
//! shared queue; each finished task is reported to the collector, which
//! sums bytes and tracks wall-clock time from first dispatch to last
//! completion.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::ProbeError;
use super::scope::Scope;
use super::throughput::{BytesPerSecond, ProbeProgress, Throughput};

pub type Task = BoxFuture<'static, Transfer>;

/// Fixed policy for one probe: how many transfers run at once and how long
/// the whole probe may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeLimits {
    pub concurrency: usize,
    pub max_duration: Duration,
}

/// Outcome of one transfer. Bytes moved before a failure are kept.
#[derive(Debug)]
pub struct Transfer {
    pub bytes: u64,
    pub error: Option<ProbeError>,
}

impl Transfer {
    pub fn complete(bytes: u64) -> Self {
        Self { bytes, error: None }
    }

    pub fn failed(bytes: u64, error: ProbeError) -> Self {
        Self {
            bytes,
            error: Some(error),
        }
    }
}

#[derive(Debug)]
pub struct Collected {
    pub throughput: Throughput,
    /// Tasks that ran to completion or failure
    pub completed: usize,
    /// Tasks never started because the scope finished first
    pub skipped: usize,
    /// First error observed, if any
    pub error: Option<ProbeError>,
}

impl Collected {
    pub fn rate(&self) -> Option<BytesPerSecond> {
        self.throughput.rate()
    }
}

pub struct ProberGroup {
    limit: usize,
    queue: VecDeque<Task>,
    scope: Scope,
}

impl ProberGroup {
    pub fn new(limit: usize, scope: Scope) -> Result<Self, ProbeError> {
        if limit == 0 {
            return Err(ProbeError::InvalidSetting {
                name: "concurrency limit",
                value: limit,
            });
        }
        Ok(Self {
            limit,
            queue: VecDeque::new(),
            scope,
        })
    }

    pub fn add<F>(&mut self, task: F)
    where
        F: Future<Output = Transfer> + Send + 'static,
    {
        self.queue.push_back(Box::pin(task));
    }

    /// Runs every queued task and waits for all of them.
    pub async fn collect(self) -> Collected {
        self.collect_with(None).await
    }

    /// Like [`collect`](Self::collect), also pushing a running estimate to
    /// `sink` after each task completes. A closed sink is ignored.
    pub async fn collect_streaming(self, sink: mpsc::Sender<ProbeProgress>) -> Collected {
        self.collect_with(Some(sink)).await
    }

    pub async fn collect_with(self, sink: Option<mpsc::Sender<ProbeProgress>>) -> Collected {
        let ProberGroup {
            limit,
            queue,
            scope,
        } = self;

        let total = queue.len();
        let workers = limit.min(total);
        let queue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::unbounded_channel();

        debug!(tasks = total, workers, "dispatching prober group");
        let start = Instant::now();

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker(Arc::clone(&queue), scope.clone(), tx.clone()));
        }
        drop(tx);

        let mut throughput = Throughput::default();
        let mut completed = 0;
        let mut error: Option<ProbeError> = None;

        while let Some(transfer) = rx.recv().await {
            completed += 1;
            throughput.add(transfer.bytes);
            throughput.elapsed = start.elapsed();

            if let Some(err) = transfer.error {
                if error.is_none() {
                    debug!(error = %err, bytes = transfer.bytes, "first task error");
                    error = Some(err);
                }
            }

            if let (Some(sink), Some(rate)) = (&sink, throughput.rate()) {
                let _ = sink
                    .send(ProbeProgress {
                        rate,
                        total_bytes: throughput.total_bytes,
                        completed,
                        total,
                    })
                    .await;
            }
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!("prober worker ended abnormally: {}", e);
                if error.is_none() {
                    error = Some(ProbeError::TaskPanicked {
                        message: e.to_string(),
                    });
                }
            }
        }

        let skipped = queue.lock().unwrap_or_else(PoisonError::into_inner).len();
        if skipped > 0 {
            debug!(skipped, "tasks left unstarted");
            if error.is_none() {
                error = Some(scope.err().unwrap_or_else(|| ProbeError::TaskPanicked {
                    message: format!("workers stopped with {skipped} tasks queued"),
                }));
            }
        }

        debug!(
            completed,
            bytes = throughput.total_bytes,
            elapsed_ms = throughput.elapsed.as_millis() as u64,
            "prober group collected"
        );

        Collected {
            throughput,
            completed,
            skipped,
            error,
        }
    }
}

async fn worker(
    queue: Arc<Mutex<VecDeque<Task>>>,
    scope: Scope,
    results: mpsc::UnboundedSender<Transfer>,
) {
    loop {
        if scope.is_done() {
            break;
        }
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(task) = next else {
            break;
        };
        // A panicking task fails on its own; the worker keeps draining.
        let transfer = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(transfer) => transfer,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("task panicked: {}", message);
                Transfer::failed(0, ProbeError::TaskPanicked { message })
            }
        };
        if results.send(transfer).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
