use crate::app::{App, Panel, ProbeSummary};
use crate::speedtest::TestPhase;
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};

// Palette
const ACCENT: Color = Color::Rgb(100, 149, 237);
const SUCCESS: Color = Color::Rgb(134, 194, 156);
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220);
const INFO_DIM: Color = Color::Rgb(90, 110, 140);
const WARN: Color = Color::Rgb(220, 180, 130);
const ERROR: Color = Color::Rgb(220, 120, 120);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

const EMPTY: &str = "—";

/// One throughput probe as the panels draw it.
struct RateView<'a> {
    title: &'static str,
    color: Color,
    dim_color: Color,
    mbps: f64,
    progress: f64,
    samples: &'a [f64],
    summary: Option<&'a ProbeSummary>,
}

impl<'a> RateView<'a> {
    fn download(app: &'a App) -> Self {
        Self {
            title: "Download",
            color: SUCCESS,
            dim_color: SUCCESS_DIM,
            mbps: current_rate(app.result.download_mbps, &app.download_samples),
            progress: download_progress(app),
            samples: &app.download_samples,
            summary: app.download.as_ref(),
        }
    }

    fn upload(app: &'a App) -> Self {
        Self {
            title: "Upload",
            color: INFO,
            dim_color: INFO_DIM,
            mbps: current_rate(app.result.upload_mbps, &app.upload_samples),
            progress: upload_progress(app),
            samples: &app.upload_samples,
            summary: app.upload.as_ref(),
        }
    }

    /// "timed out" or the failure, once the probe is over.
    fn note(&self) -> Option<(String, Color)> {
        let summary = self.summary?;
        if let Some(err) = &summary.error {
            Some((format!("failed: {err}"), ERROR))
        } else if summary.timed_out {
            Some(("timed out".to_string(), TEXT_MUTED))
        } else {
            None
        }
    }
}

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(8),
        Constraint::Length(1),
    ])
    .split(area);

    draw_header(frame, chunks[0], app);

    if app.expanded {
        match app.selected_panel {
            Panel::Download => draw_rate_expanded(frame, chunks[1], &RateView::download(app)),
            Panel::Upload => draw_rate_expanded(frame, chunks[1], &RateView::upload(app)),
            Panel::Server => draw_server_expanded(frame, chunks[1], app),
        }
    } else {
        let panels = Layout::horizontal([
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
        ])
        .split(chunks[1]);

        draw_rate_panel(
            frame,
            panels[0],
            &RateView::download(app),
            app.selected_panel == Panel::Download,
        );
        draw_rate_panel(
            frame,
            panels[1],
            &RateView::upload(app),
            app.selected_panel == Panel::Upload,
        );
        draw_server_panel(frame, panels[2], app, app.selected_panel == Panel::Server);
    }

    draw_help(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([
        Constraint::Length(12),
        Constraint::Min(10),
        Constraint::Length(24),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new("speedprobe")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        chunks[0],
    );

    let (status, color) = match (&app.error, app.phase) {
        (Some(err), _) => (err.clone(), ERROR),
        (None, TestPhase::Idle) => ("Ready".to_string(), TEXT_MUTED),
        (None, TestPhase::Selecting) => ("Selecting server...".to_string(), WARN),
        (None, TestPhase::Download) => ("Testing download...".to_string(), SUCCESS),
        (None, TestPhase::Upload) => ("Testing upload...".to_string(), INFO),
        (None, TestPhase::Complete) => ("Complete".to_string(), ACCENT),
    };

    frame.render_widget(
        Paragraph::new(status)
            .style(Style::default().fg(color))
            .alignment(Alignment::Center),
        chunks[1],
    );

    frame.render_widget(
        Paragraph::new(phase_line(app.phase)).alignment(Alignment::Right),
        chunks[2],
    );
}

fn phase_line(phase: TestPhase) -> Line<'static> {
    let phases = [
        (TestPhase::Selecting, "select"),
        (TestPhase::Download, "down"),
        (TestPhase::Upload, "up"),
    ];
    let rank = |p: TestPhase| match p {
        TestPhase::Idle => 0,
        TestPhase::Selecting => 1,
        TestPhase::Download => 2,
        TestPhase::Upload => 3,
        TestPhase::Complete => 4,
    };

    let mut spans = Vec::new();
    for (i, (p, label)) in phases.iter().enumerate() {
        let style = if phase == *p {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else if rank(phase) > rank(*p) {
            Style::default().fg(TEXT_SECONDARY)
        } else {
            Style::default().fg(TEXT_MUTED)
        };
        spans.push(Span::styled(*label, style));
        if i < phases.len() - 1 {
            spans.push(Span::styled(" / ", Style::default().fg(TEXT_MUTED)));
        }
    }

    Line::from(spans)
}

fn panel_block(title: &str, color: Color, selected: bool) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if selected { BORDER_ACTIVE } else { BORDER }))
        .title(Span::styled(
            format!(" {title} "),
            Style::default().fg(if selected { color } else { TEXT_SECONDARY }),
        ))
}

fn draw_rate_panel(frame: &mut Frame, area: Rect, view: &RateView, selected: bool) {
    let block = panel_block(view.title, view.color, selected);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new(format_speed(view.mbps))
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    if let Some((note, color)) = view.note() {
        frame.render_widget(
            Paragraph::new(note)
                .style(Style::default().fg(color))
                .alignment(Alignment::Center),
            chunks[1],
        );
    }

    draw_progress_bar(frame, chunks[2], view.progress, view.color, view.dim_color);

    if !view.samples.is_empty() {
        draw_sparkline(frame, chunks[3], view.samples, view.color);
    }
}

fn draw_server_panel(frame: &mut Frame, area: Rect, app: &App, selected: bool) {
    let block = panel_block("Server", WARN, selected);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    let latency = current_rate(app.result.ping_ms, &app.latency_samples);
    let value = if latency > 0.0 {
        format!("{latency:.1} ms")
    } else {
        EMPTY.to_string()
    };
    frame.render_widget(
        Paragraph::new(value)
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    let jitter = if app.selection.is_some() {
        format!("jitter {:.1} ms", app.result.jitter_ms)
    } else {
        format!("jitter {EMPTY}")
    };
    frame.render_widget(
        Paragraph::new(jitter)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );

    let host = match &app.selection {
        Some(s) => format!("{} · {}", s.server.sponsor, s.distance),
        None => EMPTY.to_string(),
    };
    frame.render_widget(
        Paragraph::new(host)
            .style(Style::default().fg(TEXT_SECONDARY))
            .alignment(Alignment::Center),
        chunks[2],
    );

    if !app.latency_samples.is_empty() {
        draw_sparkline(frame, chunks[3], &app.latency_samples, WARN);
    }
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio * width as f64) as usize).min(width);
    let empty = width.saturating_sub(filled);

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

fn draw_sparkline(frame: &mut Frame, area: Rect, data: &[f64], color: Color) {
    if area.width < 4 || area.height < 2 {
        return;
    }

    let (min_val, max_val) = data_range(data);
    let range = (max_val - min_val).max(1.0);
    let points = indexed(data);

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .x_axis(Axis::default().bounds([0.0, data.len() as f64]))
        .y_axis(Axis::default().bounds([min_val - range * 0.1, max_val + range * 0.1]));

    frame.render_widget(chart, area);
}

fn draw_rate_expanded(frame: &mut Frame, area: Rect, view: &RateView) {
    let block = panel_block(view.title, view.color, true);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(4),
    ])
    .split(inner);

    let (avg, max, min) = stats(view.samples);
    let mut spans = vec![
        Span::styled(
            format_speed(view.mbps),
            Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
        ),
        separator(),
        Span::styled(format!("avg {}", format_speed(avg)), Style::default().fg(TEXT_MUTED)),
        separator(),
        Span::styled(format!("max {}", format_speed(max)), Style::default().fg(TEXT_MUTED)),
        separator(),
        Span::styled(format!("min {}", format_speed(min)), Style::default().fg(TEXT_MUTED)),
    ];
    if let Some(summary) = view.summary {
        spans.push(separator());
        spans.push(Span::styled(
            format_bytes(summary.total_bytes),
            Style::default().fg(TEXT_MUTED),
        ));
    }
    if let Some((note, color)) = view.note() {
        spans.push(separator());
        spans.push(Span::styled(note, Style::default().fg(color)));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).alignment(Alignment::Center), chunks[0]);

    draw_progress_bar(frame, chunks[1], view.progress, view.color, view.dim_color);
    draw_detailed_chart(frame, chunks[2], view.samples, view.color, "Mbps");
}

fn draw_server_expanded(frame: &mut Frame, area: Rect, app: &App) {
    let block = panel_block("Server", WARN, true);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(4),
    ])
    .split(inner);

    let host = match &app.selection {
        Some(s) => Line::from(vec![
            Span::styled(
                format!("{} ({})", s.server.sponsor, s.server.name),
                Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
            ),
            separator(),
            Span::styled(format!("id {}", s.server.id), Style::default().fg(TEXT_MUTED)),
            separator(),
            Span::styled(s.distance.to_string(), Style::default().fg(TEXT_SECONDARY)),
        ]),
        None => Line::from(Span::styled("no server selected", Style::default().fg(TEXT_MUTED))),
    };
    frame.render_widget(Paragraph::new(host).alignment(Alignment::Center), chunks[0]);

    let (avg, max, min) = stats(&app.latency_samples);
    let jitter = match app.selection {
        Some(_) => format!("{:.1}", app.result.jitter_ms),
        None => EMPTY.to_string(),
    };
    let line = Line::from(vec![
        Span::styled(
            format!("{:.1} ms", app.result.ping_ms),
            Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
        ),
        separator(),
        Span::styled(format!("jitter {jitter} ms"), Style::default().fg(TEXT_SECONDARY)),
        separator(),
        Span::styled(format!("avg {avg:.0}"), Style::default().fg(TEXT_MUTED)),
        separator(),
        Span::styled(format!("max {max:.0}"), Style::default().fg(TEXT_MUTED)),
        separator(),
        Span::styled(format!("min {min:.0}"), Style::default().fg(TEXT_MUTED)),
    ]);
    frame.render_widget(Paragraph::new(line).alignment(Alignment::Center), chunks[1]);

    draw_detailed_chart(frame, chunks[2], &app.latency_samples, WARN, "ms");
}

fn draw_detailed_chart(frame: &mut Frame, area: Rect, data: &[f64], color: Color, unit: &str) {
    if data.is_empty() || area.width < 10 || area.height < 3 {
        return;
    }

    let (min_val, max_val) = data_range(data);
    let range = (max_val - min_val).max(0.1);
    let y_min = (min_val - range * 0.1).max(0.0);
    let y_max = max_val + range * 0.1;

    let points = indexed(data);
    let (avg, _, _) = stats(data);
    let avg_line = [(0.0, avg), (data.len() as f64, avg)];

    let datasets = vec![
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(color))
            .data(&points),
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(TEXT_MUTED))
            .data(&avg_line),
    ];

    let y_labels = vec![
        Span::styled(format!("{y_min:.0}"), Style::default().fg(TEXT_MUTED)),
        Span::styled(format!("{y_max:.0} {unit}"), Style::default().fg(TEXT_MUTED)),
    ];

    let chart = Chart::new(datasets)
        .x_axis(
            Axis::default()
                .style(Style::default().fg(BORDER))
                .bounds([0.0, data.len() as f64]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(BORDER))
                .bounds([y_min, y_max])
                .labels(y_labels),
        );

    frame.render_widget(chart, area);
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    let help = if app.expanded {
        "esc close · q quit"
    } else if app.is_running() {
        "tab select · space expand · esc cancel · q quit"
    } else {
        "enter start · tab select · space expand · q quit"
    };

    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

fn separator() -> Span<'static> {
    Span::styled("  ·  ", Style::default().fg(TEXT_MUTED))
}

/// Final value once known, otherwise the latest sample.
fn current_rate(final_value: f64, samples: &[f64]) -> f64 {
    if final_value > 0.0 {
        final_value
    } else {
        samples.last().copied().unwrap_or(0.0)
    }
}

fn indexed(data: &[f64]) -> Vec<(f64, f64)> {
    data.iter().enumerate().map(|(i, &v)| (i as f64, v)).collect()
}

fn data_range(data: &[f64]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let min = data.iter().copied().fold(f64::MAX, f64::min);
    let max = data.iter().copied().fold(f64::MIN, f64::max);
    (min, max)
}

fn stats(data: &[f64]) -> (f64, f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let (min, max) = data_range(data);
    (data.iter().sum::<f64>() / data.len() as f64, max, min)
}

fn download_progress(app: &App) -> f64 {
    match app.phase {
        TestPhase::Download => app.download_progress,
        TestPhase::Upload | TestPhase::Complete if app.download.is_some() => 1.0,
        _ => 0.0,
    }
}

fn upload_progress(app: &App) -> f64 {
    match app.phase {
        TestPhase::Upload => app.upload_progress,
        TestPhase::Complete if app.upload.is_some() => 1.0,
        _ => 0.0,
    }
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.1} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.0} Kbps", mbps * 1000.0)
    } else {
        EMPTY.to_string()
    }
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= 1024.0 * MIB {
        format!("{:.2} GiB", b / (1024.0 * MIB))
    } else if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else {
        format!("{:.0} KiB", b / 1024.0)
    }
}
