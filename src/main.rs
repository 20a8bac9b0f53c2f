mod app;
mod logging;
mod settings;
mod speedtest;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use app::{poll_event, spawn_speed_test, App, AppAction, ProbeSummary, TestUpdate};
use clap::Parser;
use crossterm::event::Event;
use ratatui::DefaultTerminal;
use settings::Settings;
use speedtest::client::{HttpClient, ReqwestClient};
use speedtest::geo::Coordinates;
use speedtest::scope::Scope;
use speedtest::server::{load_servers, Server, ServerId};
use tokio::sync::mpsc;
use tracing::info;
use ui::draw_ui;

#[derive(Parser, Debug)]
#[command(name = "speedprobe")]
#[command(version)]
#[command(about = "Terminal internet speed test with latency-based server selection.")]
struct Args {
    /// JSON file listing candidate servers
    #[arg(long, value_name = "FILE")]
    servers: PathBuf,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    lat: f64,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    lon: f64,

    /// Probe this server instead of picking the fastest nearby one
    #[arg(long, value_name = "ID")]
    server: Option<u32>,

    #[arg(long)]
    latency_samples: Option<usize>,

    /// Seconds allowed for server selection
    #[arg(long, value_name = "SECS")]
    latency_timeout: Option<u64>,

    /// Seconds the download probe may run
    #[arg(long, value_name = "SECS")]
    download_time: Option<u64>,

    /// Seconds the upload probe may run
    #[arg(long, value_name = "SECS")]
    upload_time: Option<u64>,

    /// Download from range endpoints instead of the server's images
    #[arg(long = "range-target", value_name = "URL")]
    range_targets: Vec<String>,

    #[arg(long)]
    no_download: bool,

    #[arg(long)]
    no_upload: bool,

    /// Print results as lines instead of running the TUI
    #[arg(long)]
    plain: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn settings(&self) -> Settings {
        let defaults = Settings::default();
        let mut settings = Settings {
            origin: Coordinates::new(self.lat, self.lon),
            server_id: self.server.map(ServerId),
            latency_samples: self.latency_samples.unwrap_or(defaults.latency_samples),
            latency_timeout: self
                .latency_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.latency_timeout),
            range_targets: self.range_targets.clone(),
            run_download: !self.no_download,
            run_upload: !self.no_upload,
            ..defaults
        };
        if let Some(secs) = self.download_time {
            settings = settings.with_download_time(Duration::from_secs(secs));
        }
        if let Some(secs) = self.upload_time {
            settings = settings.with_upload_time(Duration::from_secs(secs));
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The TUI owns the terminal, so only plain mode logs to stderr.
    logging::init(&args.log_level, args.log_file.as_deref(), args.plain)
        .context("failed to initialize logging")?;

    let servers = load_servers(&args.servers)
        .with_context(|| format!("cannot read servers from {}", args.servers.display()))?;
    info!(count = servers.len(), "loaded server list");

    let client: Arc<dyn HttpClient> =
        Arc::new(ReqwestClient::new().context("failed to build HTTP client")?);
    let servers = Arc::new(servers);
    let settings = args.settings();

    if args.plain {
        return run_plain(client, servers, settings).await;
    }

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, client, servers, settings).await;

    ratatui::restore();
    result
}

async fn run_plain(
    client: Arc<dyn HttpClient>,
    servers: Arc<Vec<Server>>,
    settings: Settings,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let scope = Scope::new();
    let session = spawn_speed_test(tx, scope.clone(), client, servers, settings);

    let mut failure = None;
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(TestUpdate::ServerSelected(s)) => println!(
                    "Using server hosted by {} ({}) [{}]: {:.1} ms",
                    s.server.sponsor,
                    s.server.name,
                    s.distance,
                    s.latency.as_secs_f64() * 1000.0
                ),
                Some(TestUpdate::DownloadComplete(summary)) => {
                    println!("{}", summary_line("Download", &summary))
                }
                Some(TestUpdate::UploadComplete(summary)) => {
                    println!("{}", summary_line("Upload", &summary))
                }
                Some(TestUpdate::Failed(message)) => failure = Some(message),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => scope.cancel(),
        }
    }
    session.await.context("speed test task panicked")?;

    match failure {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}

fn summary_line(label: &str, summary: &ProbeSummary) -> String {
    let mut line = match summary.rate {
        Some(rate) => format!("{label}: {rate}"),
        None => format!("{label}: n/a"),
    };
    if summary.timed_out {
        line.push_str(" (timed out)");
    }
    if let Some(err) = &summary.error {
        line.push_str(&format!(" (failed: {err})"));
    }
    line
}

async fn run_app(
    terminal: &mut DefaultTerminal,
    client: Arc<dyn HttpClient>,
    servers: Arc<Vec<Server>>,
    settings: Settings,
) -> Result<()> {
    let mut app = App::new();
    let mut test_rx: Option<mpsc::Receiver<TestUpdate>> = None;

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        // Handle test updates
        if let Some(rx) = test_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(update) => app.apply(update),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        app.complete_test();
                        test_rx = None;
                        break;
                    }
                }
            }
        }

        // Handle input
        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        let scope = app.start_test();
                        let (tx, rx) = mpsc::channel(64);
                        test_rx = Some(rx);
                        spawn_speed_test(
                            tx,
                            scope,
                            Arc::clone(&client),
                            Arc::clone(&servers),
                            settings.clone(),
                        );
                    }
                    AppAction::CancelTest => {
                        app.cancel_test();
                        test_rx = None;
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    app.cancel_test();
    Ok(())
}
