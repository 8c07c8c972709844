
use igmpd::config::{Config, QuerierConfig, ResponderConfig};
use igmpd::daemon::{ControlCommand, Daemon};
use igmpd::igmp::{RawIgmpSocket, ALL_IGMPV3_ROUTERS_GROUP};
use igmpd::querier::Querier;
use igmpd::responder::Responder;
use igmpd::timer::MonotonicClock;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use std::net::Ipv4Addr;
use std::path::PathBuf;


fn main() {
    env_logger::init();
    let args = Cli::parse();
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration from {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    log::debug!("Configuration: {:?}", config);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async move {
        match args.subcmd {
            Command::Querier => match config.querier {
                Some(querier) => start_querier(querier).await,
                None => Err(missing_section("querier")),
            },

            Command::Responder => match config.responder {
                Some(responder) => start_responder(responder).await,
                None => Err(missing_section("responder")),
            },
        }
    });

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn missing_section(name: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("no [{}] section in configuration", name))
}

fn open_socket(source: Ipv4Addr) -> Result<RawIgmpSocket, std::io::Error> {
    let socket = RawIgmpSocket::new()?;
    socket.set_header_included(true)?;
    socket.set_multicast_if(source)?;
    socket.set_multicast_loop(false)?;
    Ok(socket)
}

async fn start_querier(config: QuerierConfig) -> Result<(), std::io::Error> {
    let source = config.source;
    let socket = open_socket(source)?;
    socket.set_multicast_all(true)?;
    socket.join_multicast(ALL_IGMPV3_ROUTERS_GROUP, source)?;

    let clock = MonotonicClock::new();
    let querier = Querier::new(config, clock.now());
    let daemon = Daemon::new(querier, socket.into_async()?, clock);

    log::info!("Querier started on {}", source);
    daemon.run().await
}

async fn start_responder(config: ResponderConfig) -> Result<(), std::io::Error> {
    let source = config.source;
    let groups = config.groups.clone();
    let socket = open_socket(source)?.into_async()?;

    let clock = MonotonicClock::new();
    let daemon = Daemon::new(Responder::with_entropy(config), socket, clock);

    for group in groups {
        apply(&daemon, ControlCommand::Join(group), source).await;
    }

    let control = daemon.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    log::info!("stdin closed, no more control commands");
                    break;
                }
                Err(e) => {
                    log::warn!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<ControlCommand>() {
                Ok(command) => apply(&control, command, source).await,
                Err(e) => log::warn!("Invalid command {:?}: {}", line, e),
            }
        }
    });

    log::info!("Responder started on {}", source);
    daemon.run().await
}

/// Updates the engine first; the kernel membership only follows a change
/// the engine accepted.
async fn apply(daemon: &Daemon<Responder>, command: ControlCommand, source: Ipv4Addr) {
    let socket = daemon.socket();
    match command {
        ControlCommand::Join(group) => {
            if daemon.control(|responder, now| responder.join(now, group)).await.is_ok() {
                if let Err(e) = socket.get_ref().join_multicast(group, source) {
                    log::warn!("Failed to join {} in the kernel: {}", group, e);
                }
            }
        }

        ControlCommand::Leave(group) => {
            if daemon.control(|responder, now| responder.leave(now, group)).await.is_ok() {
                if let Err(e) = socket.get_ref().leave_multicast(group, source) {
                    log::warn!("Failed to leave {} in the kernel: {}", group, e);
                }
            }
        }
    }
}


/// IGMPv3 querier and responder
#[derive(Debug, Clone, Parser)]
#[clap(name = "igmpd", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short, long, default_value = "/etc/igmpd.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub subcmd: Command,
}

#[derive(Debug, Clone, Subcommand)]
#[non_exhaustive]
pub enum Command {
    /// act as the link's IGMPv3 querier
    Querier,

    /// answer queries and announce group membership for this host
    Responder,
}
