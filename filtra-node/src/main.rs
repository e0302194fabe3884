//! filtra node — entry point.
//!
//! ```text
//! filtra-node dispatcher             Run the dispatcher
//! filtra-node worker                 Run a worker
//! filtra-node client <dir>           Filter every image in <dir>
//! filtra-node --config <path> ...    Load a custom config TOML
//! filtra-node gen-config             Write default config to stdout
//! ```

mod config;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use filtra_core::{Client, Dispatcher, Node, Worker};

use crate::config::NodeConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "filtra-node", about = "Distributed image filtering over UDP")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "filtra.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher.
    Dispatcher {
        /// Override the listening port.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a worker.
    Worker {
        /// Override the median filter window size.
        #[arg(short, long)]
        window: Option<usize>,
    },
    /// Submit a directory of images and write the filtered results.
    Client {
        /// Directory of images (overrides the config's input_dir).
        input: Option<PathBuf>,
    },
    /// Print the default configuration to stdout and exit.
    GenConfig,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = NodeConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("filtra-node v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Dispatcher { port } => run_dispatcher(config, port).await,
        Command::Worker { window } => run_worker(config, window).await,
        Command::Client { input } => run_client(config, input).await,
        Command::GenConfig => unreachable!(),
    }
}

// ── Roles ────────────────────────────────────────────────────────

async fn run_dispatcher(
    config: NodeConfig,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or(config.network.dispatcher_port);
    let mut node = Node::bind(Dispatcher::new(), port).await?;
    info!("dispatcher listening on port {}", node.local_port());
    node.start().await;

    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl-C received — shutting down");
    node.stop();
    Ok(())
}

async fn run_worker(
    config: NodeConfig,
    window: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let window = window.unwrap_or(config.worker.filter_window);
    if window % 2 == 0 {
        warn!("filter window {window} is even; effective window is {}", window + 1);
    }

    let worker = Worker::new(&config.network.dispatcher_ip, config.network.dispatcher_port)
        .with_advertised_ip(&config.worker.advertised_ip)
        .with_window(window);
    let mut node = Node::bind(worker, config.network.listen_port).await?;
    info!(
        "worker on port {}, dispatcher {}:{}, window {window}",
        node.local_port(),
        config.network.dispatcher_ip,
        config.network.dispatcher_port,
    );
    node.start().await;

    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl-C received — shutting down");
    node.stop();
    Ok(())
}

async fn run_client(
    config: NodeConfig,
    input: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let input_dir = input.unwrap_or_else(|| PathBuf::from(&config.client.input_dir));
    let output_dir = PathBuf::from(&config.client.output_dir);
    std::fs::create_dir_all(&output_dir)?;

    let images = Client::load_images(&input_dir)?;
    if images.is_empty() {
        warn!("no images found in {}", input_dir.display());
        return Ok(());
    }
    let total = images.len();

    let (mut client, mut results) =
        Client::new(&config.network.dispatcher_ip, config.network.dispatcher_port);
    let staged = client.stage(images);

    let mut node = Node::bind(client, config.network.listen_port).await?;
    info!("client on port {}, submitting {total} images", node.local_port());
    node.start().await;

    let out = node.outbound();
    let interval = Duration::from_millis(config.client.send_interval_ms);
    for msg in staged {
        out.send(msg).await?;
        tokio::time::sleep(interval).await;
    }

    let timeout = Duration::from_secs(config.client.result_timeout_secs);
    let mut received = 0usize;
    while received < total {
        match tokio::time::timeout(timeout, results.recv()).await {
            Ok(Some(processed)) => {
                received += 1;
                let path = output_dir.join(format!("filtered_{}", processed.filename));
                match std::fs::write(&path, &processed.image_bytes) {
                    Ok(()) => info!(
                        "saved {} ({received}/{total}, {:.2}s round trip)",
                        path.display(),
                        processed.elapsed.as_secs_f64(),
                    ),
                    Err(e) => error!("failed to write {}: {e}", path.display()),
                }
            }
            Ok(None) => {
                error!("results channel closed with {} images outstanding", total - received);
                break;
            }
            Err(_) => {
                error!(
                    "timed out after {}s with {} images outstanding",
                    timeout.as_secs(),
                    total - received,
                );
                break;
            }
        }
    }

    info!("done: {received}/{total} images filtered");
    node.stop();
    Ok(())
}
