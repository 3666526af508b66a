///
/// This module implements the CLI interface for site-indexer: command parsing, argument
/// validation and the async entrypoint.
///
/// All core business logic (site loading, keyword extraction, diffing, the local proxy and
/// publishing) lives in the [`site-indexer-core`] crate. This module is strictly CLI glue.
///
/// ## How To Use
/// - For command-line users: `site-indexer index-site --site <name> --contenttype <type>`
///   with optional `--server <name>`, `--publish true|false` and `--config <file>`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// [`site-indexer-core`]: ../../site-indexer-core/
use crate::load_config::{load_config, resolve_server};
use crate::remote::HttpRemoteClient;
use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use site_indexer_core::config::IndexRequest;
use site_indexer_core::context::RunControl;
use site_indexer_core::synchronise::run_index_site;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI for site-indexer: keep a site's search index in sync with its pages.
#[derive(Parser)]
#[clap(
    name = "site-indexer",
    version,
    about = "Build and publish the search index of a site on a remote content repository"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index every page of a site into items of the given content type
    IndexSite {
        /// Name of the site
        #[clap(long)]
        site: String,
        /// Content type holding the index records
        #[clap(long)]
        contenttype: String,
        /// Registered server to use (defaults to the config's default_server)
        #[clap(long)]
        server: Option<String>,
        /// Publish the index items once written
        #[clap(long, default_value_t = false, action = ArgAction::Set)]
        publish: bool,
        /// Path to the YAML config file
        #[clap(long, default_value = "site-indexer.yaml")]
        config: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emitted first so tests can check tracing is wired.
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::IndexSite {
            site,
            contenttype,
            server,
            publish,
            config,
        } => {
            let config = load_config(config)?;
            let server = resolve_server(&config, server.as_deref())?;
            tracing::info!(command = "index-site", site = %site, server = %server.name, publish, "Starting site indexing");

            let routes = config.routes();
            let remote = Arc::new(HttpRemoteClient::new(&server, routes.clone()));

            let mut request = IndexRequest::new(site, contenttype);
            request.publish = publish;
            request.poll_interval = config.publish.poll_interval();
            request.publish_timeout = config.publish.timeout();

            let control = RunControl::new();
            let cancel = control.cancel_token();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Received Ctrl+C, cancelling site indexing");
                    cancel.cancel();
                }
            });

            let outcome = run_index_site(remote, routes, request, control).await;
            interrupt.abort();

            match outcome {
                Ok(report) => {
                    for pass in &report.passes {
                        tracing::info!(
                            locale = %pass.locale,
                            skipped = pass.skipped,
                            nothing_to_index = pass.nothing_to_index,
                            created = pass.created.len(),
                            updated = pass.updated.len(),
                            unchanged = pass.unchanged,
                            deleted = pass.deleted.len(),
                            "Locale pass summary"
                        );
                    }
                    if let Some(published) = &report.published {
                        tracing::info!(job_id = %published.job_id, items = published.item_ids.len(), "Index items published");
                    }
                    tracing::info!(command = "index-site", site = %report.site, "Site indexing complete");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "index-site", error = %e, "Site indexing failed");
                    Err(anyhow::Error::new(e))
                }
            }
        }
    }
}
