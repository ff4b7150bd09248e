//! lesson-sync: share lessons with peers on the local network.
//!
//! `serve` advertises over mDNS and accepts any number of peers.
//! `join` connects to one peer, either by address or by discovering one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lesson_sync_core::{ServerInfo, SyncEvent};
use lesson_sync_daemon::{MdnsDiscovery, Mode, SessionOptions, SessionOrchestrator, SyncConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lesson-sync")]
#[command(about = "Peer-to-peer lesson sharing")]
struct Args {
    /// JSON seed file with username, port, preferences and lessons
    #[arg(short, long)]
    seed: Option<PathBuf>,

    /// Display name announced to peers (overrides the seed file)
    #[arg(short, long)]
    username: Option<String>,

    /// Port to listen on (overrides the seed file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Advertise and accept peers
    Serve,
    /// Join a peer
    Join {
        /// Peer address; discovers the first advertised peer when omitted
        #[arg(long)]
        host: Option<String>,

        /// Seconds to wait for the connection to be established
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.seed {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load seed file {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,lesson_sync_daemon=debug,lesson_sync_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args)?;
    info!("Starting lesson-sync as {}", config.username);
    info!(
        "{} local lesson(s), interested in topics {:?}",
        config.lessons.len(),
        config.preferences
    );

    let options = match &args.command {
        Command::Join { timeout, .. } => SessionOptions {
            connect_timeout: Duration::from_secs(*timeout),
            ..SessionOptions::default()
        },
        Command::Serve => SessionOptions::default(),
    };

    let discovery = MdnsDiscovery::new().context("Failed to start mDNS")?;
    let orchestrator = SessionOrchestrator::with_options(config, discovery, options);

    let (peers_tx, mut peers_rx) = mpsc::unbounded_channel::<Vec<ServerInfo>>();
    let _subscription = orchestrator.subscribe(move |event| match event {
        SyncEvent::LessonsUpdated { lessons } => {
            for lesson in lessons {
                info!(
                    "Received \"{}\" (topic {}, id {}) from {}",
                    lesson.title,
                    lesson.topic_id,
                    lesson.id,
                    lesson.source.as_deref().unwrap_or("?")
                );
            }
        }
        SyncEvent::PeersChanged { servers } => {
            info!("{} peer(s) advertising", servers.len());
            let _ = peers_tx.send(servers.clone());
        }
        SyncEvent::SessionFailed { reason } => warn!("Sync failed: {}", reason),
    });

    match &args.command {
        Command::Serve => {
            if let Err(e) = orchestrator.select_mode(Mode::Server) {
                warn!("Advertising failed, peers must join by address: {}", e);
            }
        }
        Command::Join { host, .. } => {
            if let Err(e) = orchestrator.select_mode(Mode::Client) {
                warn!("Discovery failed: {}", e);
            }
            let server = match host {
                Some(host) => ServerInfo {
                    host: host.clone(),
                    name: host.clone(),
                    port: orchestrator.config().port,
                },
                None => {
                    info!("Looking for peers...");
                    let found = tokio::select! {
                        servers = first_peer(&mut peers_rx) => servers,
                        _ = tokio::signal::ctrl_c() => None,
                    };
                    match found {
                        Some(server) => server,
                        None => {
                            orchestrator.stop();
                            return Ok(());
                        }
                    }
                }
            };
            orchestrator.choose_server(server)?;
        }
    }

    let addr = orchestrator.confirm_start().await?;
    match &args.command {
        Command::Serve => info!("Serving lessons on {}", addr),
        Command::Join { .. } => info!("Syncing with {}", addr),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    orchestrator.stop();

    let view = orchestrator.view();
    info!(
        "Holding {} lesson(s), {} new this run",
        view.lessons.len(),
        view.new_lessons_count
    );
    Ok(())
}

/// First non-empty peer list, reduced to its first entry.
async fn first_peer(peers_rx: &mut mpsc::UnboundedReceiver<Vec<ServerInfo>>) -> Option<ServerInfo> {
    while let Some(servers) = peers_rx.recv().await {
        if let Some(server) = servers.into_iter().next() {
            info!("Joining {} at {}:{}", server.name, server.host, server.port);
            return Some(server);
        }
    }
    None
}
