//! Streaming product downloads and finalization.
//!
//! A download streams the bearer-authorized response to a staged file, chunk
//! by chunk. Two failure conditions are classified as transient and handed
//! back as data for the orchestrator's retry loop: a connection dropping
//! mid-stream, and the response stream breaking down mid-transfer (the usual
//! symptom of an access token expiring during a long download). Everything
//! else propagates as a hard error.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use thiserror::Error;
use tracing::warn;

use crate::api::Product;

const DOWNLOAD_URL_BASE: &str = "https://zipper.dataspace.copernicus.eu/odata/v1/Products";

/// Canonical extension for CDSE product archives
const ARCHIVE_EXTENSION: &str = "zip";

#[derive(Debug, Error)]
pub enum TransientError {
    #[error("Connection dropped mid-stream: {0}")]
    ConnectionDropped(String),

    #[error("Response stream broke mid-transfer: {0}")]
    StreamDecode(String),
}

/// Per-attempt result, consumed by the orchestrator's retry loop. Transient
/// failures are data, not errors, so callers branch instead of catching.
#[derive(Debug)]
pub enum DownloadOutcome {
    Complete { bytes: u64 },
    TransientFailure(TransientError),
}

/// Download seam for the orchestrator; stubbed in tests.
pub trait ProductDownloader {
    async fn download(
        &self,
        product: &Product,
        access_token: &str,
        staging_path: &Path,
    ) -> Result<DownloadOutcome>;
}

pub struct HttpDownloader {
    client: Client,
    chunk_size: usize,
}

impl HttpDownloader {
    pub fn new(client: Client, chunk_size: usize) -> Self {
        Self { client, chunk_size }
    }
}

impl ProductDownloader for HttpDownloader {
    async fn download(
        &self,
        product: &Product,
        access_token: &str,
        staging_path: &Path,
    ) -> Result<DownloadOutcome> {
        let url = format!("{}({})/$value", DOWNLOAD_URL_BASE, product.id);

        let response = match self.client.get(&url).bearer_auth(access_token).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Ok(DownloadOutcome::TransientFailure(
                    TransientError::ConnectionDropped(e.to_string()),
                ));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Download request for {} failed", product.name));
            }
        };

        if !response.status().is_success() {
            anyhow::bail!(
                "Download of {} rejected with status {}",
                product.name,
                response.status()
            );
        }

        // Content-Length drives the progress bar only, never correctness
        let total = response.content_length().or(product.content_length);
        let bar = byte_progress_bar(&product.name, total);

        let file = File::create(staging_path)
            .with_context(|| format!("Failed to create staging file {}", staging_path.display()))?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);

        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    bar.abandon();
                    return Ok(DownloadOutcome::TransientFailure(classify_stream_error(e)));
                }
            };
            if chunk.is_empty() {
                continue;
            }
            writer
                .write_all(&chunk)
                .with_context(|| format!("Failed to write to {}", staging_path.display()))?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }

        writer
            .flush()
            .with_context(|| format!("Failed to flush {}", staging_path.display()))?;
        bar.finish_and_clear();

        Ok(DownloadOutcome::Complete { bytes: written })
    }
}

fn classify_stream_error(e: reqwest::Error) -> TransientError {
    if e.is_decode() {
        TransientError::StreamDecode(e.to_string())
    } else {
        TransientError::ConnectionDropped(e.to_string())
    }
}

fn byte_progress_bar(name: &str, total: Option<u64>) -> ProgressBar {
    let bar = match total {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
                )
                .unwrap()
                .progress_chars("#>-"),
            );
            bar
        }
        None => ProgressBar::new_spinner(),
    };
    bar.set_message(name.to_string());
    bar
}

/// Replace the staged file's extension with the canonical archive extension
/// and move it into the destination directory. A collision or missing staged
/// file is reported and skipped; the downloaded bytes are never undone.
pub fn finalize(staging_path: &Path, dest_dir: &Path) -> Result<Option<PathBuf>> {
    let file_name = staging_path
        .file_name()
        .context("Staged file has no file name")?;
    let dest = dest_dir.join(Path::new(file_name).with_extension(ARCHIVE_EXTENSION));

    if !staging_path.exists() {
        warn!(path = %staging_path.display(), "staged file missing, nothing to finalize");
        return Ok(None);
    }
    if dest.exists() {
        warn!(path = %dest.display(), "destination already exists, leaving staged file in place");
        return Ok(None);
    }

    fs::rename(staging_path, &dest)
        .with_context(|| format!("Failed to move {} into place", staging_path.display()))?;
    Ok(Some(dest))
}
