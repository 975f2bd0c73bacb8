use anyhow::Context;
use clap::{Parser, Subcommand};
use pulse::client::{ActivityDebouncer, DebounceConfig, SyncController, SyncUpdate};
use pulse::config::AppConfig;
use pulse::error::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pulse", about = "Live-state sync service for an agent operator dashboard")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Follow a running server's push stream and print updates
    Watch {
        /// Server base URL
        #[arg(long)]
        server: Option<String>,
        /// Opaque identity material for the stream handshake
        #[arg(long, env = "PULSE_IDENTITY")]
        identity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let mut cfg = AppConfig::load_from(&cli.config_dir)
                .context("failed to load configuration")?;
            init_logging(&cfg);
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Err(errors) = cfg.validate() {
                for error in &errors {
                    warn!("config: {}", error);
                }
                anyhow::bail!("invalid configuration ({} problems)", errors.len());
            }
            pulse::server::serve(cfg).await?;
        }
        Commands::Watch { server, identity } => {
            let mut cfg = AppConfig::load_from(&cli.config_dir).unwrap_or_default();
            init_logging(&cfg);
            if let Some(server) = server {
                cfg.client.server_url = server;
            }
            run_watch(cfg, identity).await?;
        }
    }
    Ok(())
}

async fn run_watch(cfg: AppConfig, identity: Option<String>) -> Result<()> {
    let debounce_cfg = DebounceConfig::from_client_config(&cfg.client);
    let mut debouncer = ActivityDebouncer::new(debounce_cfg);

    let controller = SyncController::new(cfg.client.clone(), identity);
    let (handle, mut updates) = controller.spawn();

    let shutdown = pulse::server::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                handle.shutdown().await;
                info!("watch stopped");
                return Ok(());
            }
            update = updates.recv() => {
                let Some(update) = update else {
                    return Ok(());
                };
                match update {
                    SyncUpdate::Phase(phase) => info!(?phase, "sync phase"),
                    SyncUpdate::Raw { event, .. } => info!(%event, "event"),
                    SyncUpdate::Snapshot(live) => {
                        let now = chrono::Utc::now();
                        debouncer.apply_snapshot(&live, now);
                        for agent in &live.agents {
                            info!(
                                agent = %agent.id,
                                status = ?agent.status,
                                shown = ?debouncer.shown(&agent.id),
                                "agent"
                            );
                        }
                    }
                }
            }
        }
    }
}

fn init_logging(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,pulse={}", cfg.logging.level)));

    if cfg.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}
