use anyhow::Result;
use clap::Parser;
use site_indexer::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // SITE_INDEXER_TOKEN / SITE_INDEXER_PASSWORD may come from .env
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "[SITE-INDEXER] Starting");
    let result = run(cli).await;
    match &result {
        Ok(()) => tracing::info!("[SITE-INDEXER] Finished"),
        Err(e) => tracing::error!(error = %e, "[SITE-INDEXER] Aborted"),
    }
    result
}
