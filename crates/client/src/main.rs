mod participant;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tether::{ClientConfig, ClientSession, DEFAULT_PORT, DisconnectReason, create_driver, load_toml};
use uuid::Uuid;

use participant::Participant;

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Headless tether session participant")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:7777",
        help = "Server address to connect to (e.g., 127.0.0.1:7777)"
    )]
    server: String,

    #[arg(short, long, help = "Version string sent in the handshake")]
    version: Option<String>,

    #[arg(short, long, help = "Participant identity (random when omitted)")]
    identity: Option<Uuid>,

    #[arg(long, default_value_t = 500, help = "Simulated level load time in ms")]
    load_ms: u64,

    #[arg(long, help = "Leave the session after this many seconds")]
    duration: Option<u64>,

    #[arg(short, long, help = "TOML file with client settings")]
    config: Option<PathBuf>,
}

fn split_address(address: &str) -> Result<(&str, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in {}", address))?;
            Ok((host, port))
        }
        None => Ok((address, DEFAULT_PORT)),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config: ClientConfig = match &args.config {
        Some(path) => load_toml(path)?,
        None => ClientConfig::default(),
    };
    if let Some(version) = args.version {
        config.version = version;
    }
    if let Some(identity) = args.identity {
        config.identity = identity;
    }

    let (host, port) = split_address(&args.server)?;
    let driver = create_driver(config.driver, &config.transport)?;
    let mut session = ClientSession::new(config, driver)?;
    session.connect(host, port)?;

    let mut participant = Participant::new(session, Duration::from_millis(args.load_ms));
    log::info!("identity {}", participant.session().identity());
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        if let Some((reason, detail)) = participant.tick() {
            log::info!(
                "session ended: {} {} ({} game messages)",
                reason,
                detail,
                participant.messages_received()
            );
            return match reason {
                DisconnectReason::User => Ok(()),
                _ if detail.is_empty() => bail!("disconnected: {}", reason),
                _ => bail!("disconnected: {} ({})", reason, detail),
            };
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("leaving the session");
            participant.leave();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("10.0.0.2:9000").unwrap(), ("10.0.0.2", 9000));
        assert_eq!(split_address("localhost").unwrap(), ("localhost", DEFAULT_PORT));
        assert!(split_address("localhost:port").is_err());
    }
}
