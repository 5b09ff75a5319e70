mod config;
mod host;
mod tui;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tether::DriverKind;

use config::HostConfig;
use host::Host;
use tui::TuiState;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Tether session host")]
struct Args {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    max_clients: Option<usize>,

    #[arg(short, long = "level", help = "Level to rotate through (repeatable)")]
    levels: Vec<String>,

    #[arg(long, help = "Seconds per level before traveling to the next")]
    level_duration: Option<u64>,

    #[arg(short, long, help = "TOML file with host settings")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Transport driver: hybrid, builtin or loopback")]
    driver: Option<DriverKind>,

    #[arg(long)]
    headless: bool,
}

impl Args {
    fn into_config(self) -> Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::load(path)?,
            None => HostConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.session.max_clients = max_clients;
        }
        if !self.levels.is_empty() {
            config.levels = self.levels;
        }
        if let Some(secs) = self.level_duration {
            config.level_duration_secs = secs;
        }
        if let Some(driver) = self.driver {
            config.session.driver = driver;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let headless = args.headless;
    let config = args.into_config()?;

    if headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut host = Host::new(config)?;

    if headless {
        match host.port() {
            Some(port) => log::info!("Host started on port {}", port),
            None => log::info!("Host started"),
        }
        host.run();
        log::info!("Host shutting down");
    } else {
        run_with_tui(&mut host)?;
    }

    Ok(())
}

fn run_with_tui(host: &mut Host) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = host.running();
    let mut tui_state = TuiState::new();

    while running.load(Ordering::SeqCst) {
        host.tick_once();

        for line in host.drain_log() {
            tui_state.push_log(line);
        }

        if let Some(channel) = tui_state.take_pending_kick() {
            host.kick(channel);
        }
        if tui_state.take_pending_travel() {
            host.next_level();
        }

        if event::poll(Duration::from_millis(1))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let peers = host.peer_infos();
                    let on_connections = tui_state.active_tab() == tui::Tab::Connections;
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            running.store(false, Ordering::SeqCst);
                        }
                        KeyCode::Tab | KeyCode::BackTab => tui_state.next_tab(),
                        KeyCode::PageUp => tui_state.scroll_up(),
                        KeyCode::PageDown => tui_state.scroll_down(),
                        KeyCode::End => tui_state.scroll_to_bottom(),
                        KeyCode::Up if on_connections => tui_state.select_prev(peers.len()),
                        KeyCode::Down if on_connections => tui_state.select_next(peers.len()),
                        KeyCode::Char('k') | KeyCode::Char('K') if on_connections => {
                            tui_state.request_kick(&peers);
                        }
                        KeyCode::Char('n') | KeyCode::Char('N') => tui_state.request_travel(),
                        _ => {}
                    }
                }
            }
        }

        let stats = host.stats();
        let peers = host.peer_infos();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &stats, &peers);
        })?;
    }

    host.shutdown();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
