//! uba_session - serves the shared tables and RPC messages for detoured tools
//!
//! Usage:
//!   uba_session --host --preload /path/to/project

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use uba_config::logging::init_logging;
use uba_config::Config;
use uba_session::{socket, SessionHandler};

#[derive(Parser)]
#[command(name = "uba_session")]
#[command(version, about = "Session server for the UBA virtualization layer", long_about = None)]
struct Cli {
    /// Socket to listen on (overrides config and UBA_SOCKET)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory for the shared tables and mapping files
    #[arg(long)]
    shm_dir: Option<PathBuf>,

    /// Directories to list into the table before any client asks
    #[arg(long, value_name = "DIR")]
    preload: Vec<String>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,

    /// Serve the host file system instead of an empty virtual one
    #[arg(long)]
    host: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::default_toml());
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.session.socket = socket;
    }
    if let Some(shm_dir) = cli.shm_dir {
        config.session.shm_dir = shm_dir;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }

    init_logging(config.log.log_level());

    let mut handler =
        SessionHandler::new(&config.session, cli.host).context("Failed to create session tables")?;
    for dir in &cli.preload {
        let offset = handler
            .preload_directory(dir)
            .with_context(|| format!("Failed to preload {}", dir))?;
        info!(dir = %dir, offset = offset.0, "Preloaded directory");
    }

    info!(
        socket = %config.session.socket.display(),
        shm_dir = %config.session.shm_dir.display(),
        host = cli.host,
        "Starting uba_session"
    );
    socket::run_listener(&config.session.socket, handler).await
}
