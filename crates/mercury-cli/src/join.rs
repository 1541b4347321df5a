//! Join command implementation for Mercury CLI.
//!
//! Attaches to a shared session and runs a file on the host's kernel.

use std::sync::Arc;
use std::time::Instant;

use mercury_core::{MercuryConfig, Server};
use mercury_share::{GuestServer, PrefixTranslator, SHARED_ROOT, transport};

use crate::run::{finish, print_header, read_source, run_file};

/// Join the session at `url` and run `file` there.
pub async fn execute(config: &MercuryConfig, url: &str, file: &str) -> anyhow::Result<()> {
    let (path, code) = read_source(file)?;
    let root = std::env::current_dir()?;
    let start = Instant::now();

    let link = transport::connect(url).await?;
    let guest = GuestServer::attach(
        link,
        Arc::new(PrefixTranslator::new(root, SHARED_ROOT)),
        config,
    )
    .await?;
    tracing::info!("Joined session at {}", url);
    print_header("Guest", &path, &guest).await;

    let result = run_file(&guest, &code, &path, config).await;
    if let Err(e) = guest.shutdown().await {
        tracing::warn!("Leaving the session failed: {}", e);
    }
    finish(&result?, start)
}
