use std::collections::VecDeque;

use log::Level;
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Row, Table, Tabs};
use tether::ChannelId;
use tether::net::ChannelMetrics;

use crate::host::{HostStats, LogLine, PeerInfo};

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Connections,
    Log,
}

impl Tab {
    const ALL: [Tab; 2] = [Tab::Connections, Tab::Log];

    fn title(self) -> &'static str {
        match self {
            Tab::Connections => "Connections",
            Tab::Log => "Log",
        }
    }

    fn index(self) -> usize {
        match self {
            Tab::Connections => 0,
            Tab::Log => 1,
        }
    }
}

pub struct TuiState {
    tab: Tab,
    log: VecDeque<LogLine>,
    scroll_back: usize,
    selected: usize,
    pending_kick: Option<ChannelId>,
    pending_travel: bool,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            tab: Tab::Connections,
            log: VecDeque::new(),
            scroll_back: 0,
            selected: 0,
            pending_kick: None,
            pending_travel: false,
        }
    }

    pub fn push_log(&mut self, line: LogLine) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    pub fn active_tab(&self) -> Tab {
        self.tab
    }

    pub fn next_tab(&mut self) {
        self.tab = Tab::ALL[(self.tab.index() + 1) % Tab::ALL.len()];
    }

    pub fn scroll_up(&mut self) {
        self.scroll_back = (self.scroll_back + 10).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self) {
        self.scroll_back = self.scroll_back.saturating_sub(10);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_back = 0;
    }

    pub fn select_prev(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + count - 1) % count;
        }
    }

    pub fn select_next(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + 1) % count;
        }
    }

    pub fn request_kick(&mut self, peers: &[PeerInfo]) {
        self.pending_kick = peers.get(self.selected).map(|peer| peer.channel);
    }

    pub fn take_pending_kick(&mut self) -> Option<ChannelId> {
        self.pending_kick.take()
    }

    pub fn request_travel(&mut self) {
        self.pending_travel = true;
    }

    pub fn take_pending_travel(&mut self) -> bool {
        std::mem::take(&mut self.pending_travel)
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &HostStats, peers: &[PeerInfo]) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Length(1),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_capacity(frame, chunks[1], stats);
    render_network(frame, chunks[2], stats);
    render_tabs(frame, chunks[3], state);
    match state.tab {
        Tab::Connections => render_connections(frame, chunks[4], state, peers),
        Tab::Log => render_log(frame, chunks[4], state),
    }
    render_help(frame, chunks[5]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &HostStats) {
    let title = format!(" Tether Host - Uptime: {} ", format_duration(stats.uptime_secs));

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let mut text = format!(
        "Tick: {}  |  Driver: {}  |  Level: {}",
        stats.tick,
        stats.driver,
        stats.level.as_deref().unwrap_or("-")
    );
    if let Some(secs) = stats.next_travel_secs {
        text.push_str(&format!("  |  Next travel in {}", format_duration(secs)));
    }

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_capacity(frame: &mut Frame, area: Rect, stats: &HostStats) {
    let block = Block::default()
        .title(" Connections ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ratio = stats.connection_count as f64 / stats.max_clients.max(1) as f64;
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{}", stats.connection_count, stats.max_clients));

    frame.render_widget(gauge, area);
}

fn render_network(frame: &mut Frame, area: Rect, stats: &HostStats) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let lines = vec![
        traffic_line("Reliable: ", &stats.metrics.reliable, &stats.rates.reliable),
        traffic_line(
            "Unreliable: ",
            &stats.metrics.unreliable,
            &stats.rates.unreliable,
        ),
    ];

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn traffic_line(
    label: &'static str,
    metrics: &ChannelMetrics,
    rate: &ChannelMetrics,
) -> Line<'static> {
    Line::from(vec![
        Span::styled(label, Style::default().fg(Color::Gray)),
        Span::styled(
            format!(
                "{} sent / {} recv  ({} / {})",
                metrics.packets_sent,
                metrics.packets_received,
                format_bytes(metrics.bytes_sent),
                format_bytes(metrics.bytes_received)
            ),
            Style::default().fg(Color::White),
        ),
        Span::styled(
            format!(
                "  {}/s out, {}/s in",
                format_bytes(rate.bytes_sent),
                format_bytes(rate.bytes_received)
            ),
            Style::default().fg(Color::DarkGray),
        ),
    ])
}

fn render_tabs(frame: &mut Frame, area: Rect, state: &TuiState) {
    let tabs = Tabs::new(Tab::ALL.iter().map(|tab| tab.title()))
        .select(state.tab.index())
        .highlight_style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        );
    frame.render_widget(tabs, area);
}

fn render_connections(frame: &mut Frame, area: Rect, state: &TuiState, peers: &[PeerInfo]) {
    let header = Row::new([
        "Id", "Channel", "Address", "Version", "Phase", "Level", "Up", "Idle", "Traffic",
    ])
    .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = peers.iter().enumerate().map(|(index, peer)| {
        let total = peer.metrics.total();
        let style = if index == state.selected {
            Style::default().fg(Color::Black).bg(Color::Cyan)
        } else {
            Style::default().fg(Color::White)
        };
        Row::new([
            peer.connection_id.to_string(),
            peer.channel.to_string(),
            peer.address.clone(),
            peer.version.clone().unwrap_or_else(|| "-".to_string()),
            peer.phase.to_string(),
            peer.level.clone().unwrap_or_else(|| "-".to_string()),
            format_duration(peer.connected_secs),
            format!("{}s", peer.idle_secs),
            format!(
                "{} / {}",
                format_bytes(total.bytes_sent),
                format_bytes(total.bytes_received)
            ),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Length(8),
            Constraint::Min(16),
            Constraint::Length(14),
            Constraint::Length(10),
            Constraint::Min(10),
            Constraint::Length(9),
            Constraint::Length(6),
            Constraint::Length(20),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL));

    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let end = state.log.len().saturating_sub(state.scroll_back);
    let start = end.saturating_sub(visible);

    let lines: Vec<Line> = state
        .log
        .range(start..end)
        .map(|line| {
            let color = match line.level {
                Level::Error => Color::Red,
                Level::Warn => Color::Yellow,
                Level::Info => Color::White,
                Level::Debug | Level::Trace => Color::DarkGray,
            };
            Line::from(Span::styled(line.message.clone(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new(
        "q/ESC quit  Tab switch view  Up/Down select  k kick  n next level  PgUp/PgDn/End scroll",
    )
    .block(block)
    .style(
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::ITALIC),
    );

    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
