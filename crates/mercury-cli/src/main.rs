//! Mercury CLI - Run code against Jupyter kernels and share sessions.

mod colors;
mod host;
mod join;
mod kernels;
mod output;
mod run;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mercury_core::MercuryConfig;
use mercury_share::ServerConfig;

use crate::session::KernelArgs;

#[derive(Parser)]
#[command(name = "mercury")]
#[command(about = "Run cell-structured code files against Jupyter kernels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file's cells and print their outputs
    Run {
        /// Path to the code file
        file: String,

        #[command(flatten)]
        kernel: KernelArgs,
    },

    /// List kernel specs and show which one would be used
    Kernels {
        #[command(flatten)]
        kernel: KernelArgs,
    },

    /// Host a shared session that guests can join
    Host {
        /// File to run once the session is up
        file: Option<String>,

        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        #[command(flatten)]
        kernel: KernelArgs,
    },

    /// Join a shared session and run a file on the host's kernel
    Join {
        /// Host share URL (ws://host:port/share)
        url: String,

        /// Path to the code file
        file: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = MercuryConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { file, kernel } => run::execute(&config, &file, &kernel).await?,

        Commands::Kernels { kernel } => kernels::execute(&config, &kernel).await?,

        Commands::Host {
            file,
            port,
            bind,
            kernel,
        } => {
            let server = ServerConfig { host: bind, port };
            host::execute(&config, file.as_deref(), &kernel, server).await?;
        }

        Commands::Join { url, file } => join::execute(&config, &url, &file).await?,
    }

    Ok(())
}
