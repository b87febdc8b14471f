//! cdse-fetch - batch downloader for Copernicus Data Space Ecosystem products.
//!
//! Authenticates against the CDSE identity service, queries the OData catalog
//! with spatial/name/date filters, and streams every matching product archive
//! to local storage, retrying transient failures per product and reporting
//! permanent ones without aborting the batch.

#![allow(async_fn_in_trait)]

mod api;
mod auth;
mod batch;
mod config;
mod download;

use std::io;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api::{CatalogClient, ProductFilter};
use auth::{CredentialResolver, CredentialStore, HttpIdentity, StoredOrPromptResolver, TokenManager};
use batch::BatchPaths;
use config::Config;
use download::HttpDownloader;

/// Connect timeout for all HTTP requests. A whole-request timeout would cut
/// off multi-gigabyte streamed downloads, so only the handshake is bounded.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    info!("cdse-fetch starting");

    // Write a config template on first run so there is something to edit
    if Config::is_first_run()? {
        let config = Config::default();
        config.save()?;
        println!(
            "Wrote a default config to {}.\nEdit the filters and date range, then run again.",
            Config::config_path()?.display()
        );
        return Ok(());
    }

    let mut config = Config::load()?;

    let username = match config.last_username.clone() {
        Some(username) => username,
        None => {
            let username = auth::credentials::prompt_username()?;
            config.last_username = Some(username.clone());
            config.save()?;
            username
        }
    };

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()?;

    let mut tokens = login(&client, &username).await?;

    let filter = ProductFilter {
        aoi_wkt: config.aoi_wkt.clone(),
        name_contains: config.name_filter.clone(),
        start_date: config.start_date,
        end_date: config.end_date,
    };

    println!(
        "Querying catalog for '{}' products, {} to {}...",
        filter.name_contains, filter.start_date, filter.end_date
    );
    let catalog = CatalogClient::new(client.clone());
    let products = catalog.search(&filter, config.page_size).await?;
    println!("{} matching products", products.len());

    if products.is_empty() {
        return Ok(());
    }

    let downloader = HttpDownloader::new(client, config.chunk_size);
    let paths = BatchPaths {
        staging_dir: config.output_dir.join(".staging"),
        dest_dir: config.output_dir.clone(),
    };

    let report = batch::run(
        &mut tokens,
        &downloader,
        &products,
        &paths,
        config.retry_budget,
    )
    .await?;

    println!(
        "\nDone: {} downloaded, {} failed",
        report.downloaded,
        report.failed.len()
    );
    for failed in &report.failed {
        println!(
            "  failed after {} attempts: {} ({})",
            failed.attempts, failed.name, failed.error
        );
    }

    // Per-product failures are reported above but do not fail the process
    Ok(())
}

/// Interactive login loop: try the stored password first; a rejection
/// discards it and prompts again until the identity service accepts.
async fn login(
    client: &reqwest::Client,
    username: &str,
) -> Result<TokenManager<HttpIdentity, StoredOrPromptResolver>> {
    let resolver = StoredOrPromptResolver;

    loop {
        let password = resolver.resolve(username)?;
        let mut manager = TokenManager::new(
            HttpIdentity::new(client.clone()),
            StoredOrPromptResolver,
            username.to_string(),
        );

        match manager.login(&password).await {
            Ok(()) => {
                println!("Login successful");
                return Ok(manager);
            }
            Err(auth::AuthError::InvalidCredentials(detail)) => {
                warn!(detail = %detail, "stored credentials rejected");
                if let Err(e) = CredentialStore::delete(username) {
                    warn!(error = %e, "could not remove rejected password from keychain");
                }
                println!("Login rejected for {}, please re-enter the password.", username);
            }
            Err(other) => return Err(other.into()),
        }
    }
}
