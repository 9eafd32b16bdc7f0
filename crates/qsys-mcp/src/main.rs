//! qsys-mcp - MCP server for Q-SYS style audio/video engines
//!
//! Subcommands:
//! - `qsys-mcp stdio --design <file>` - Serve MCP over stdio
//! - `qsys-mcp config` - Show the resolved configuration and its sources

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qsysconf::QsysConfig;
use std::path::PathBuf;

use qsys_mcp::{stdio, telemetry};

#[derive(Parser)]
#[command(name = "qsys-mcp")]
#[command(about = "MCP control surface for Q-SYS style engines")]
#[command(version)]
struct Cli {
    /// Config file used instead of ~/.qsys-mcp/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdin/stdout
    Stdio {
        /// Design file (JSON component/control inventory) served as the engine
        #[arg(long)]
        design: PathBuf,

        /// OTLP gRPC endpoint for OpenTelemetry (e.g., "localhost:4317")
        #[arg(long)]
        otlp_endpoint: Option<String>,
    },

    /// Print the resolved configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) =
        QsysConfig::load_with_sources_from(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Stdio {
            design,
            otlp_endpoint,
        } => {
            let endpoint = otlp_endpoint.or_else(|| config.telemetry.otlp_endpoint.clone());
            telemetry::init(config.telemetry.debug, endpoint.as_deref())?;

            for path in &sources.ignored {
                tracing::warn!(path = %path.display(), "ignored unreadable config file");
            }

            stdio::run(stdio::StdioConfig { config, design }).await?;
        }
        Commands::Config => {
            println!("{}", config.to_json());
            eprintln!();
            for path in &sources.files {
                eprintln!("loaded:  {}", path.display());
            }
            for path in &sources.ignored {
                eprintln!("ignored: {}", path.display());
            }
            for var in &sources.env_overrides {
                eprintln!("env:     {}", var);
            }
        }
    }

    Ok(())
}
