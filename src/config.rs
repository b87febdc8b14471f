//! Application configuration management.
//!
//! The configuration holds everything a batch run needs: the area of
//! interest, product-name filter, date range, paging/retry knobs, and the
//! destination directory. It is stored at
//! `~/.config/cdse-fetch/config.json`; a template with sensible defaults is
//! written on first run so the user has something to edit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Application name used for the config directory path
const APP_NAME: &str = "cdse-fetch";

/// Config file name
const CONFIG_FILE: &str = "config.json";

fn default_aoi_wkt() -> String {
    // Northern North America bounding polygon
    "POLYGON((-140.99778 41.6751050889,-140.99778 83.23324,\
     -52.6480987209 41.6751050889,-52.6480987209 83.23324,\
     -140.99778 41.6751050889))"
        .to_string()
}

fn default_name_filter() -> String {
    "S3A_SL_2_LST".to_string()
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2016, 4, 25).unwrap()
}

fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2016, 4, 27).unwrap()
}

fn default_page_size() -> u32 {
    100
}

fn default_chunk_size() -> usize {
    8192
}

fn default_retry_budget() -> u32 {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("products")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Username from the last successful login, offered as the default
    pub last_username: Option<String>,
    /// Area of interest as a WKT polygon in EPSG:4326 lon/lat
    #[serde(default = "default_aoi_wkt")]
    pub aoi_wkt: String,
    /// Substring matched against the product name
    #[serde(default = "default_name_filter")]
    pub name_filter: String,
    /// First content date included in the query
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    /// Last content date included in the query (inclusive)
    #[serde(default = "default_end_date")]
    pub end_date: NaiveDate,
    /// Catalog page size ($top)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// File-writer buffer capacity in bytes for streamed downloads
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Transient-failure retries allowed per product before giving up
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Directory finalized product archives are moved into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            last_username: None,
            aoi_wkt: default_aoi_wkt(),
            name_filter: default_name_filter(),
            start_date: default_start_date(),
            end_date: default_end_date(),
            page_size: default_page_size(),
            chunk_size: default_chunk_size(),
            retry_budget: default_retry_budget(),
            output_dir: default_output_dir(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// True when no config file exists yet on disk.
    pub fn is_first_run() -> Result<bool> {
        Ok(!Self::config_path()?.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.name_filter, "S3A_SL_2_LST");
        assert_eq!(config.retry_budget, 10);
        assert_eq!(config.page_size, 100);
        assert!(config.last_username.is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"last_username":"alice","start_date":"2020-01-01","end_date":"2020-01-03"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.last_username.as_deref(), Some("alice"));
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(config.end_date, NaiveDate::from_ymd_opt(2020, 1, 3).unwrap());
        assert_eq!(config.chunk_size, 8192);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.last_username = Some("bob".to_string());
        config.output_dir = PathBuf::from("/data/products");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.last_username.as_deref(), Some("bob"));
        assert_eq!(loaded.output_dir, PathBuf::from("/data/products"));
        assert_eq!(loaded.aoi_wkt, config.aoi_wkt);
    }
}
