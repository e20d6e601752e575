//! hive - clustered TCP echo demo
//!
//! One binary, two roles: launched plainly it becomes the supervisor and
//! forks `--workers` copies of itself; each copy detects the worker role
//! from its environment and serves a shared TCP echo listener. All workers
//! accept on the same kernel socket, bound once by the supervisor.
//!
//! ## Usage
//!
//! ```bash
//! # Fork two workers sharing an echo listener on a free port
//! hive --workers 2 --port 0
//!
//! # With verbose logging
//! hive -v --port 9000
//! ```
//!
//! Ctrl-C disconnects the cluster gracefully: workers close their
//! listeners, then their channels, then the supervisor drops the shared
//! sockets.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use hive_cluster::{Agent, Cluster, ClusterEvent, ClusterSettings, Supervisor};
use hive_core::logging;
use hive_ipc::ListenSpec;

/// Clustered TCP echo server.
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of workers to fork
    #[arg(short, long, default_value_t = 2)]
    workers: u32,

    /// Host to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init_logging(None, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    let cluster = match Cluster::from_env() {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("role detection failed: {e}");
            return ExitCode::from(1);
        }
    };

    let result = match cluster {
        Cluster::Master(supervisor) => run_master(supervisor, &cli).await,
        Cluster::Worker(agent) => run_worker(agent, &cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

/// Fork the workers, report their listeners, and hold the cluster together
/// until Ctrl-C or until every worker is gone.
async fn run_master(supervisor: Supervisor, cli: &Cli) -> hive_core::Result<()> {
    supervisor.setup(ClusterSettings::from_current_process()?);
    let mut events = supervisor.subscribe();

    info!(workers = cli.workers, "starting cluster");
    for _ in 0..cli.workers {
        supervisor.fork().await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                supervisor.disconnect().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ClusterEvent::Listening { id, address }) => {
                    // Scraped by the e2e harness for the bound port.
                    let mut out = std::io::stdout();
                    let _ = writeln!(out, "worker {id} listening on {address}");
                    let _ = out.flush();
                }
                Ok(ClusterEvent::Exit { id, code, signal, suicide }) => {
                    info!(worker_id = id, ?code, ?signal, suicide, "worker exited");
                    if supervisor.worker_count().await == 0 {
                        warn!("no workers left, stopping");
                        return Ok(());
                    }
                }
                Ok(ClusterEvent::Error { id, message }) => {
                    warn!(worker_id = id, %message, "worker error");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Serve the shared echo listener until the cluster disconnects us.
async fn run_worker(agent: Agent, cli: &Cli) -> hive_core::Result<()> {
    let server = agent
        .listen(ListenSpec::new(cli.host.clone(), cli.port))
        .await?;
    info!(addr = %server.local_addr(), "echoing");

    while let Some(conn) = server.accept().await {
        let (mut stream, peer) = conn?;
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.split();
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                warn!(%peer, "echo ended: {e}");
            }
        });
    }

    info!("listener closed, worker done");
    Ok(())
}
