use clap::{Parser, Subcommand};
use sightline::log_stream::{self, LogBroadcaster};

#[derive(Parser)]
#[command(name = "sightline")]
#[command(about = "Sightline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default config file with a placeholder API key. An existing file is left untouched.
    Init {
        /// Config file path (default: SIGHTLINE_CONFIG_PATH or ~/.sightline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (log stream, chat stream and screenshot over HTTP). Needs a Gemini API key.
    Gateway {
        /// Config file path (default: SIGHTLINE_CONFIG_PATH or ~/.sightline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 5001)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    // Every crate log line at info or above is also queued for /log-stream viewers.
    let logs = LogBroadcaster::new();
    if let Err(e) = log_stream::init_logging(logs.clone(), "info") {
        eprintln!("logger already initialized: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("sightline {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port, logs).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(sightline::config::default_config_path);
    if sightline::config::write_template(&path)? {
        println!("wrote default config to {}", path.display());
        println!(
            "set gemini.apiKey (or GEMINI_API_KEY) before running `sightline gateway`"
        );
    } else {
        println!("config already exists at {}", path.display());
    }
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    logs: LogBroadcaster,
) -> anyhow::Result<()> {
    let (mut config, path) = sightline::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    sightline::gateway::run_gateway(config, logs).await
}
