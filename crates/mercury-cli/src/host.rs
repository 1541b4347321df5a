//! Host command implementation for Mercury CLI.
//!
//! Starts a session and shares it over WebSocket so guests can join.

use std::sync::Arc;
use std::time::Instant;

use mercury_core::{MercuryConfig, Server};
use mercury_share::{HostServer, PrefixTranslator, SHARED_ROOT, ServerConfig};

use crate::colors;
use crate::run::{finish, print_header, read_source, run_file};
use crate::session::{self, KernelArgs};

/// Host a shared session, optionally running `file` first.
pub async fn execute(
    config: &MercuryConfig,
    file: Option<&str>,
    kernel: &KernelArgs,
    server: ServerConfig,
) -> anyhow::Result<()> {
    let source = file.map(read_source).transpose()?;
    let root = std::env::current_dir()?;

    let session = session::open(config, kernel).await?;
    let host = HostServer::new(session, Arc::new(PrefixTranslator::new(root, SHARED_ROOT)));

    match &source {
        Some((path, _)) => print_header("Hosting", path, &host).await,
        None => print_header("Hosting", "(none)", &host).await,
    }
    println!(
        "{}  ◆ Share:{} ws://{}:{}/share",
        colors::CYAN,
        colors::RESET,
        server.host,
        server.port
    );
    println!("{}", "─".repeat(50));

    if let Some((path, code)) = &source {
        let start = Instant::now();
        let cells = run_file(&host, code, path, config).await?;
        if let Err(e) = finish(&cells, start) {
            println!("{}{}{}", colors::RED, e, colors::RESET);
        }
    }

    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    let served = mercury_share::serve(host.clone(), server).await;
    if let Err(e) = host.shutdown().await {
        tracing::warn!("Session shutdown failed: {}", e);
    }
    served?;
    Ok(())
}
