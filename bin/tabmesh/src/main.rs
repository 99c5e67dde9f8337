mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabmesh")]
#[command(about = "Discover and drive browser peers over local RPC", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the listener and peer registry (long-running)
    Serve {
        /// Host to bind to (overrides config server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default: first free port of the discovery range)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a demo peer that dials every listener it discovers
    Peer {
        /// Display name reported by peer.getInfo
        #[arg(long)]
        name: Option<String>,

        /// Peer id (overrides config peer.peerId)
        #[arg(long)]
        peer_id: Option<String>,
    },

    /// Probe the discovery range once and print reachable listeners
    Scan,

    /// List peers connected to a running listener
    Peers {
        /// Listener port (discovered when omitted)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Call a procedure on a connected peer
    Call {
        /// Target peer id
        peer_id: String,

        /// Procedure dot-path, e.g. tabs.list
        procedure: String,

        /// Positional arguments as a JSON array
        #[arg(long)]
        args: Option<String>,

        /// Target tab id, sent as extraArgs.tabId
        #[arg(long)]
        tab_id: Option<i64>,

        /// Target window id, sent as extraArgs.windowId
        #[arg(long)]
        window_id: Option<i64>,

        /// Listener port (discovered when omitted)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            commands::serve::run(host, port).await?;
        }
        Commands::Peer { name, peer_id } => {
            commands::peer::run(name, peer_id).await?;
        }
        Commands::Scan => {
            commands::scan::run().await?;
        }
        Commands::Peers { port } => {
            commands::peers::run(port).await?;
        }
        Commands::Call {
            peer_id,
            procedure,
            args,
            tab_id,
            window_id,
            port,
        } => {
            commands::call::run(peer_id, procedure, args, tab_id, window_id, port).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config_cmd::show().await?,
            ConfigCommands::Init { force } => commands::config_cmd::init(force).await?,
        },
    }

    Ok(())
}
