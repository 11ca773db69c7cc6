//! broker-daemon: heartbeat broker for connected clients.
//!
//! Ingests heartbeat records over TCP, tracks live clients with a TTL, and
//! answers WebSocket clients through per-connection broker sessions.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use broker_core::Reply;
use broker_daemon::{ingest, BrokerConfig, ClientServer, Daemon, Poller};

#[derive(Parser, Debug)]
#[command(name = "broker-daemon")]
#[command(about = "Heartbeat broker for connected clients")]
struct Args {
    /// Address for heartbeat producers (port 0 picks a free port)
    #[arg(long, default_value = "0.0.0.0:0")]
    ingest_listen: String,

    /// Address for WebSocket clients
    #[arg(long, default_value = "127.0.0.1:7756")]
    client_listen: String,

    /// Milliseconds a client stays registered without a heartbeat
    #[arg(long, default_value_t = 4000)]
    ttl_ms: u64,

    /// Milliseconds between full-state polls
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Maximum number of open sessions
    #[arg(long, default_value_t = 1024)]
    max_sessions: usize,

    /// Queue depth of each reply channel
    #[arg(long, default_value_t = 256)]
    reply_capacity: usize,

    /// Milliseconds a reply may wait on a full channel before it is dropped
    #[arg(long, default_value_t = 250)]
    send_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            client_ttl: Duration::from_millis(self.ttl_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_sessions: self.max_sessions,
            reply_capacity: self.reply_capacity,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            ..BrokerConfig::default()
        }
    }
}

/// Log what a poll brought back.
fn present(reply: Reply) {
    match reply {
        Reply::AllUpdates {
            clients,
            notifications,
        } => {
            debug!("{} connected client(s)", clients.len());
            for text in notifications {
                warn!("Process died: {}", text);
            }
        }
        other => debug!("Ignoring {} on the poll channel", other.kind()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,broker_daemon=debug"
    } else {
        "info,broker_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting broker-daemon");

    let config = args.broker_config();
    let poll_interval = config.poll_interval;
    let daemon = Daemon::new(config);
    let broker = daemon.broker().clone();

    // Heartbeat ingestion
    let ingest_listener = ingest::bind(&args.ingest_listen).await?;
    broker.set_assigned_port(ingest_listener.local_addr()?.port());
    let (ingest_tx, mut ingest_rx) = mpsc::unbounded_channel();
    tokio::spawn(ingest::serve(ingest_listener, ingest_tx));

    // Client endpoint
    let client_listener = ClientServer::bind(&args.client_listen).await?;
    tokio::spawn(ClientServer::new(broker.clone()).serve(client_listener));

    // Periodic full-state poll for the local presenter
    let (poll_tx, mut poll_rx) = broker.reply_channel();
    let _poller = Poller::spawn(broker.clone(), poll_interval, poll_tx);

    info!("Broker running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(item) = ingest_rx.recv() => {
                daemon.apply(item);
            }

            Some(reply) = poll_rx.recv() => {
                present(reply);
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down ({} open session(s))", broker.session_count());
    Ok(())
}
