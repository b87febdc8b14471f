//! Batch orchestration.
//!
//! Drives every candidate product through `Pending -> Attempting ->
//! {Downloaded, FailedPermanent}`. The access token is refreshed just-in-time
//! before each attempt, transient failures retry the same product immediately
//! (no backoff) until the retry budget is spent, and a permanently failed
//! product is recorded and skipped - the run itself keeps going.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::api::Product;
use crate::auth::AccessTokenSource;
use crate::download::{self, DownloadOutcome, ProductDownloader};

/// Where staged files are written and finalized archives end up.
pub struct BatchPaths {
    pub staging_dir: PathBuf,
    pub dest_dir: PathBuf,
}

#[derive(Debug)]
pub struct FailedProduct {
    pub name: String,
    pub attempts: u32,
    pub error: String,
}

/// Terminal states of one run. Every candidate lands in exactly one bucket;
/// per-product failures never fail the run as a whole.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub downloaded: usize,
    pub finalized: Vec<PathBuf>,
    pub failed: Vec<FailedProduct>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Download every candidate, retrying transient failures up to
/// `retry_budget` extra attempts per product. Authentication failures are
/// fatal to the whole run; download failures are fatal only to their product.
pub async fn run(
    tokens: &mut impl AccessTokenSource,
    downloader: &impl ProductDownloader,
    products: &[Product],
    paths: &BatchPaths,
    retry_budget: u32,
) -> Result<BatchReport> {
    fs::create_dir_all(&paths.staging_dir)
        .with_context(|| format!("Failed to create {}", paths.staging_dir.display()))?;
    fs::create_dir_all(&paths.dest_dir)
        .with_context(|| format!("Failed to create {}", paths.dest_dir.display()))?;

    let overall = batch_progress_bar(products.len() as u64);
    let mut report = BatchReport::default();

    for product in products {
        let staging = paths.staging_dir.join(&product.name);
        match attempt_product(tokens, downloader, product, &staging, retry_budget).await? {
            Ok(bytes) => {
                info!(product = %product.name, bytes, "download complete");
                if let Some(dest) = download::finalize(&staging, &paths.dest_dir)? {
                    report.finalized.push(dest);
                }
                report.downloaded += 1;
            }
            Err(failed) => {
                warn!(
                    product = %failed.name,
                    attempts = failed.attempts,
                    error = %failed.error,
                    "giving up on product"
                );
                // Partial bytes are useless without resumption support
                let _ = fs::remove_file(&staging);
                report.failed.push(failed);
            }
        }
        overall.inc(1);
    }

    overall.finish_and_clear();
    Ok(report)
}

/// Retry loop for one product. `Ok(Ok(bytes))` is a completed download,
/// `Ok(Err(..))` a spent retry budget; hard errors bubble out.
async fn attempt_product(
    tokens: &mut impl AccessTokenSource,
    downloader: &impl ProductDownloader,
    product: &Product,
    staging: &Path,
    retry_budget: u32,
) -> Result<std::result::Result<u64, FailedProduct>> {
    let mut failures = 0u32;

    loop {
        // Access tokens outlive single requests but not long batches, so
        // refresh immediately before every attempt.
        let access_token = tokens.access_token().await?;

        match downloader.download(product, &access_token, staging).await? {
            DownloadOutcome::Complete { bytes } => return Ok(Ok(bytes)),
            DownloadOutcome::TransientFailure(err) => {
                failures += 1;
                if failures > retry_budget {
                    return Ok(Err(FailedProduct {
                        name: product.name.clone(),
                        attempts: failures,
                        error: err.to_string(),
                    }));
                }
                warn!(
                    product = %product.name,
                    attempt = failures,
                    error = %err,
                    "transient download failure, retrying"
                );
            }
        }
    }
}

fn batch_progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("Products [{bar:30.green/white}] {pos}/{len}")
            .unwrap()
            .progress_chars("#>-"),
    );
    bar
}
