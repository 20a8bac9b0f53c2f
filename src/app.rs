use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::settings::Settings;
use crate::speedtest::{
    client::HttpClient,
    download::{probe_download, probe_range_download},
    ping::LatencyProber,
    prober::Collected,
    scope::Scope,
    select::{select_server, Selection},
    server::Server,
    throughput::{BytesPerSecond, ProbeProgress},
    upload::probe_upload,
    ProbeError, SpeedTestResult, TestPhase,
};

/// Samples kept for the latency sparkline.
const MAX_LATENCY_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Download,
    Upload,
    Server,
}

impl Panel {
    pub fn next(self) -> Self {
        match self {
            Panel::Download => Panel::Upload,
            Panel::Upload => Panel::Server,
            Panel::Server => Panel::Download,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Panel::Download => Panel::Server,
            Panel::Upload => Panel::Download,
            Panel::Server => Panel::Upload,
        }
    }
}

/// How one download or upload probe ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSummary {
    pub rate: Option<BytesPerSecond>,
    pub total_bytes: u64,
    /// The probe's deadline ended it. The rate still counts.
    pub timed_out: bool,
    /// First transfer failure, if any
    pub error: Option<String>,
}

impl From<Collected> for ProbeSummary {
    fn from(collected: Collected) -> Self {
        let Collected {
            throughput, error, ..
        } = collected;
        let timed_out = matches!(error, Some(ProbeError::TimedOut));
        Self {
            rate: throughput.rate(),
            total_bytes: throughput.total_bytes,
            timed_out,
            error: error.filter(|e| !e.is_cancellation()).map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TestUpdate {
    LatencySample(Duration),
    ServerSelected(Selection),
    DownloadProgress(ProbeProgress),
    DownloadComplete(ProbeSummary),
    UploadProgress(ProbeProgress),
    UploadComplete(ProbeSummary),
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
}

pub struct App {
    pub phase: TestPhase,
    pub result: SpeedTestResult,
    pub should_quit: bool,

    // UI state
    pub selected_panel: Panel,
    pub expanded: bool,

    pub selection: Option<Selection>,
    pub download: Option<ProbeSummary>,
    pub upload: Option<ProbeSummary>,
    pub error: Option<String>,

    // Progress tracking
    pub download_progress: f64,
    pub upload_progress: f64,

    // Rate samples in Mbps, latency samples in ms
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub latency_samples: Vec<f64>,

    scope: Option<Scope>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            phase: TestPhase::Idle,
            result: SpeedTestResult::default(),
            should_quit: false,
            selected_panel: Panel::Download,
            expanded: false,
            selection: None,
            download: None,
            upload: None,
            error: None,
            download_progress: 0.0,
            upload_progress: 0.0,
            download_samples: Vec::new(),
            upload_samples: Vec::new(),
            latency_samples: Vec::new(),
            scope: None,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, TestPhase::Idle | TestPhase::Complete)
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Enter => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if !self.is_running() {
                    Some(AppAction::StartTest)
                } else {
                    self.expanded = true;
                    None
                }
            }
            KeyCode::Esc => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.is_running() {
                    Some(AppAction::CancelTest)
                } else {
                    None
                }
            }
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('j') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.next();
                }
                None
            }
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('k') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.prev();
                }
                None
            }
            KeyCode::Char(' ') => {
                self.expanded = !self.expanded;
                None
            }
            _ => None,
        }
    }

    /// Clears the previous run and hands back the scope for the new one.
    pub fn start_test(&mut self) -> Scope {
        let expanded = self.expanded;
        let panel = self.selected_panel;
        *self = Self {
            selected_panel: panel,
            expanded,
            ..Self::new()
        };
        self.phase = TestPhase::Selecting;

        let scope = Scope::new();
        self.scope = Some(scope.clone());
        scope
    }

    pub fn cancel_test(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
        self.phase = TestPhase::Idle;
    }

    /// Called when the session's update stream ends.
    pub fn complete_test(&mut self) {
        self.scope = None;
        if self.phase != TestPhase::Idle {
            self.phase = TestPhase::Complete;
        }
    }

    pub fn apply(&mut self, update: TestUpdate) {
        match update {
            TestUpdate::LatencySample(rtt) => {
                self.latency_samples.push(rtt.as_secs_f64() * 1000.0);
                if self.latency_samples.len() > MAX_LATENCY_SAMPLES {
                    self.latency_samples.remove(0);
                }
            }
            TestUpdate::ServerSelected(selection) => {
                self.result.ping_ms = selection.latency.as_secs_f64() * 1000.0;
                self.result.jitter_ms = selection.jitter.as_secs_f64() * 1000.0;
                self.selection = Some(selection);
                self.phase = TestPhase::Download;
            }
            TestUpdate::DownloadProgress(p) => {
                self.download_progress = p.ratio();
                self.download_samples.push(p.rate.mbps());
            }
            TestUpdate::DownloadComplete(summary) => {
                self.result.download_mbps = summary.rate.map(BytesPerSecond::mbps).unwrap_or(0.0);
                self.download_progress = 1.0;
                self.download = Some(summary);
                self.phase = TestPhase::Upload;
            }
            TestUpdate::UploadProgress(p) => {
                self.upload_progress = p.ratio();
                self.upload_samples.push(p.rate.mbps());
            }
            TestUpdate::UploadComplete(summary) => {
                self.result.upload_mbps = summary.rate.map(BytesPerSecond::mbps).unwrap_or(0.0);
                self.upload_progress = 1.0;
                self.upload = Some(summary);
                self.phase = TestPhase::Complete;
            }
            TestUpdate::Failed(message) => {
                self.error = Some(message);
                self.phase = TestPhase::Complete;
            }
        }
    }
}

/// Relays every item from a probe's progress sink to the UI channel until
/// the probe drops its sender.
fn forward<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    update_tx: mpsc::Sender<TestUpdate>,
    wrap: fn(T) -> TestUpdate,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if update_tx.send(wrap(item)).await.is_err() {
                break;
            }
        }
    })
}

/// One session: select a server, then download, then upload, reporting
/// each step on `update_tx`. Cancelling `scope` ends the session with
/// [`ProbeError::Cancelled`].
pub async fn run_speed_test(
    update_tx: mpsc::Sender<TestUpdate>,
    scope: Scope,
    client: Arc<dyn HttpClient>,
    servers: Arc<Vec<Server>>,
    settings: Settings,
) -> Result<(), ProbeError> {
    let selection = {
        let prober = LatencyProber::new(Arc::clone(&client), settings.latency_samples)?;
        let (sample_tx, sample_rx) = mpsc::channel(32);
        let relay = forward(sample_rx, update_tx.clone(), TestUpdate::LatencySample);
        let prober = prober.with_progress(sample_tx);
        let latency_scope = scope.child_with_timeout(settings.latency_timeout);

        let selected = select_server(
            &servers,
            settings.origin,
            settings.selection_mode(),
            &prober,
            &latency_scope,
        )
        .await;
        drop(prober);
        latency_scope.cancel();
        let _ = relay.await;
        selected?
    };
    let _ = update_tx
        .send(TestUpdate::ServerSelected(selection.clone()))
        .await;

    if settings.run_download {
        let (progress_tx, progress_rx) = mpsc::channel(32);
        let relay = forward(progress_rx, update_tx.clone(), TestUpdate::DownloadProgress);
        let collected = if settings.range_targets.is_empty() {
            probe_download(
                Arc::clone(&client),
                &selection.server,
                settings.download_limits(),
                &scope,
                Some(progress_tx),
            )
            .await
        } else {
            probe_range_download(
                Arc::clone(&client),
                &settings.range_targets,
                settings.download_limits(),
                &scope,
                Some(progress_tx),
            )
            .await
        };
        let _ = relay.await;
        let collected = collected?;
        if let Some(err) = scope.err() {
            return Err(err);
        }
        let _ = update_tx
            .send(TestUpdate::DownloadComplete(collected.into()))
            .await;
    }

    if settings.run_upload {
        let (progress_tx, progress_rx) = mpsc::channel(32);
        let relay = forward(progress_rx, update_tx.clone(), TestUpdate::UploadProgress);
        let collected = probe_upload(
            Arc::clone(&client),
            &selection.server,
            settings.upload,
            &scope,
            Some(progress_tx),
        )
        .await;
        let _ = relay.await;
        let collected = collected?;
        if let Some(err) = scope.err() {
            return Err(err);
        }
        let _ = update_tx
            .send(TestUpdate::UploadComplete(collected.into()))
            .await;
    }

    info!("speed test session finished");
    Ok(())
}

/// Runs a session in the background. A failure is reported as
/// [`TestUpdate::Failed`] before the update channel closes.
pub fn spawn_speed_test(
    update_tx: mpsc::Sender<TestUpdate>,
    scope: Scope,
    client: Arc<dyn HttpClient>,
    servers: Arc<Vec<Server>>,
    settings: Settings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let failure_tx = update_tx.clone();
        if let Err(err) = run_speed_test(update_tx, scope, client, servers, settings).await {
            if err.is_cancellation() {
                info!("speed test session stopped: {}", err);
            } else if err.is_fatal() {
                error!("speed test cannot run: {}", err);
            } else {
                warn!("speed test session failed: {}", err);
            }
            let _ = failure_tx.send(TestUpdate::Failed(failure_message(&err))).await;
        }
    })
}

/// Configuration errors won't go away on a retry, so they say where to look.
fn failure_message(err: &ProbeError) -> String {
    if err.is_fatal() {
        format!("{err} (check the server list and settings)")
    } else {
        err.to_string()
    }
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::geo::Coordinates;
    use crate::speedtest::prober::ProbeLimits;
    use crate::speedtest::server::{test_server, ServerId};
    use crate::speedtest::testing::{FakeClient, Script};
    use crate::speedtest::throughput::Throughput;
    use crossterm::event::{KeyEvent, KeyModifiers};

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn quick_settings() -> Settings {
        let limits = ProbeLimits {
            concurrency: 4,
            max_duration: Duration::from_secs(5),
        };
        Settings {
            origin: Coordinates::new(0.0, 0.0),
            latency_samples: 2,
            download: limits,
            range_download: limits,
            upload: limits,
            ..Settings::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<TestUpdate>) -> Vec<TestUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    }

    #[test]
    fn test_panel_cycle() {
        assert_eq!(Panel::Download.next(), Panel::Upload);
        assert_eq!(Panel::Server.next(), Panel::Download);
        assert_eq!(Panel::Download.prev(), Panel::Server);
    }

    #[test]
    fn test_enter_starts_only_when_idle() {
        let mut app = App::new();
        assert!(matches!(app.handle_key_event(press(KeyCode::Enter)), Some(AppAction::StartTest)));

        app.start_test();
        assert_eq!(app.phase, TestPhase::Selecting);
        assert!(app.handle_key_event(press(KeyCode::Enter)).is_none());
        assert!(app.expanded);
    }

    #[test]
    fn test_esc_cancels_running_session() {
        let mut app = App::new();
        let scope = app.start_test();

        assert!(matches!(app.handle_key_event(press(KeyCode::Esc)), Some(AppAction::CancelTest)));
        app.cancel_test();

        assert!(scope.is_done());
        assert!(matches!(scope.err(), Some(ProbeError::Cancelled)));
        assert_eq!(app.phase, TestPhase::Idle);
    }

    #[test]
    fn test_apply_walks_phases() {
        let mut app = App::new();
        app.start_test();

        app.apply(TestUpdate::LatencySample(Duration::from_millis(12)));
        app.apply(TestUpdate::ServerSelected(Selection {
            server: test_server(3, 0.0, 0.0),
            latency: Duration::from_millis(15),
            jitter: Duration::from_millis(2),
            distance: crate::speedtest::geo::Kilometers(4.0),
        }));
        assert_eq!(app.phase, TestPhase::Download);
        assert_eq!(app.latency_samples, vec![12.0]);
        assert_eq!(app.result.ping_ms, 15.0);
        assert_eq!(app.result.jitter_ms, 2.0);

        app.apply(TestUpdate::DownloadProgress(ProbeProgress {
            rate: BytesPerSecond(1_000_000.0),
            total_bytes: 1_000_000,
            completed: 1,
            total: 4,
        }));
        assert_eq!(app.download_progress, 0.25);
        assert_eq!(app.download_samples, vec![8.0]);

        app.apply(TestUpdate::DownloadComplete(ProbeSummary {
            rate: Some(BytesPerSecond(2_000_000.0)),
            total_bytes: 4_000_000,
            timed_out: true,
            error: None,
        }));
        assert_eq!(app.phase, TestPhase::Upload);
        assert_eq!(app.result.download_mbps, 16.0);

        app.apply(TestUpdate::UploadComplete(ProbeSummary {
            rate: None,
            total_bytes: 0,
            timed_out: false,
            error: None,
        }));
        assert_eq!(app.phase, TestPhase::Complete);
        assert_eq!(app.result.upload_mbps, 0.0);
    }

    #[test]
    fn test_failure_completes_session() {
        let mut app = App::new();
        app.start_test();
        app.apply(TestUpdate::Failed("server not found: 9".into()));

        assert_eq!(app.phase, TestPhase::Complete);
        assert_eq!(app.error.as_deref(), Some("server not found: 9"));
    }

    #[test]
    fn test_summary_separates_timeout_from_failure() {
        let timed_out = ProbeSummary::from(Collected {
            throughput: Throughput {
                total_bytes: 1000,
                elapsed: Duration::from_secs(1),
            },
            completed: 3,
            skipped: 2,
            error: Some(ProbeError::TimedOut),
        });
        assert!(timed_out.timed_out);
        assert!(timed_out.error.is_none());
        assert_eq!(timed_out.rate, Some(BytesPerSecond(1000.0)));

        let failed = ProbeSummary::from(Collected {
            throughput: Throughput {
                total_bytes: 1000,
                elapsed: Duration::from_secs(1),
            },
            completed: 5,
            skipped: 0,
            error: Some(ProbeError::transfer("http://a", "reset")),
        });
        assert!(!failed.timed_out);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_session_reports_every_step() {
        // Server 1 answers latency probes slowly, so server 2 wins.
        let client = Arc::new(FakeClient::new(Script::body(1000)).route(
            "server1.example:8080/speedtest/latency.txt",
            Script::body(10).latency(Duration::from_millis(30)),
        ));
        let servers = Arc::new(vec![test_server(1, 0.0, 2.0), test_server(2, 0.0, 1.0)]);
        let (tx, rx) = mpsc::channel(1024);

        run_speed_test(tx, Scope::new(), client, servers, quick_settings())
            .await
            .unwrap();
        let updates = drain(rx).await;

        let samples = updates
            .iter()
            .filter(|u| matches!(u, TestUpdate::LatencySample(_)))
            .count();
        assert_eq!(samples, 4);

        let kinds: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                TestUpdate::ServerSelected(s) => Some(format!("selected {}", s.server.id)),
                TestUpdate::DownloadComplete(_) => Some("download".to_string()),
                TestUpdate::UploadComplete(_) => Some("upload".to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["selected 2", "download", "upload"]);
    }

    #[tokio::test]
    async fn test_session_skips_disabled_probes() {
        let client = Arc::new(FakeClient::new(Script::body(10)));
        let servers = Arc::new(vec![test_server(1, 0.0, 1.0)]);
        let settings = Settings {
            run_download: false,
            run_upload: false,
            ..quick_settings()
        };
        let (tx, rx) = mpsc::channel(64);

        run_speed_test(tx, Scope::new(), client.clone(), servers, settings)
            .await
            .unwrap();
        let updates = drain(rx).await;

        assert!(matches!(updates.last(), Some(TestUpdate::ServerSelected(_))));
        assert!(client.requests().iter().all(|u| u.ends_with("latency.txt")));
    }

    #[tokio::test]
    async fn test_session_uses_range_targets() {
        let client = Arc::new(FakeClient::new(Script::body(10)));
        let servers = Arc::new(vec![test_server(1, 0.0, 1.0)]);
        let settings = Settings {
            range_targets: vec!["https://edge.example/speedtest".into()],
            run_upload: false,
            ..quick_settings()
        };
        let (tx, rx) = mpsc::channel(1024);

        run_speed_test(tx, Scope::new(), client.clone(), servers, settings)
            .await
            .unwrap();
        drop(drain(rx).await);

        let ranged = client
            .requests()
            .iter()
            .filter(|u| u.starts_with("https://edge.example/speedtest/range/0-"))
            .count();
        assert_eq!(ranged, 50);
    }

    #[tokio::test]
    async fn test_unknown_server_fails_session() {
        let client = Arc::new(FakeClient::new(Script::body(10)));
        let servers = Arc::new(vec![test_server(1, 0.0, 1.0)]);
        let settings = Settings {
            server_id: Some(ServerId(77)),
            ..quick_settings()
        };
        let (tx, rx) = mpsc::channel(16);

        spawn_speed_test(tx, Scope::new(), client.clone(), servers, settings)
            .await
            .unwrap();
        let updates = drain(rx).await;

        assert!(matches!(
            updates.as_slice(),
            [TestUpdate::Failed(msg)] if msg == "server not found: 77 (check the server list and settings)"
        ));
        assert!(client.requests().is_empty());
    }

    #[test]
    fn test_failure_message_points_at_configuration() {
        assert_eq!(
            failure_message(&ProbeError::NoServers),
            format!("{} (check the server list and settings)", ProbeError::NoServers)
        );
        let transfer = ProbeError::transfer("http://a", "reset");
        assert_eq!(failure_message(&transfer), transfer.to_string());
    }

    #[tokio::test]
    async fn test_cancelled_session_stops() {
        let client = Arc::new(FakeClient::new(
            Script::body(100_000).chunk_delay(Duration::from_millis(20)),
        ));
        let servers = Arc::new(vec![test_server(1, 0.0, 1.0)]);
        let scope = Scope::new();
        let (tx, rx) = mpsc::channel(1024);

        let canceller = {
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                scope.cancel();
            })
        };
        let res = run_speed_test(tx, scope, client, servers, quick_settings()).await;
        canceller.await.unwrap();
        let updates = drain(rx).await;

        assert!(matches!(res, Err(ProbeError::Cancelled)));
        assert!(!updates
            .iter()
            .any(|u| matches!(u, TestUpdate::UploadComplete(_))));
    }
}
