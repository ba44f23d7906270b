use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Holds paths and endpoint secrets; crawl knobs and the site profile live in
/// the TOML [`crate::FileConfig`].
#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub targets_path: PathBuf,

    // Browser backend. A Browserless URL wins over a local Chrome launch.
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub chrome_bin: Option<String>,
    pub headless: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            config_path: env::var("PLACECRAWL_CONFIG")
                .unwrap_or_else(|_| "placecrawl.toml".to_string())
                .into(),
            data_dir: env::var("DATA_DIR")
                .unwrap_or_else(|_| "data".to_string())
                .into(),
            targets_path: env::var("TARGETS_CSV")
                .unwrap_or_else(|_| "data/adm_dong_list.csv".to_string())
                .into(),
            browserless_url: non_empty_env("BROWSERLESS_URL"),
            browserless_token: non_empty_env("BROWSERLESS_TOKEN"),
            chrome_bin: non_empty_env("CHROME_BIN"),
            headless: env::var("HEADLESS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("HEADLESS must be true or false")?,
        };

        Ok(config)
    }

    pub fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let head: String = v.chars().take(4).collect();
                    format!("{head}...({} chars)", v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  PLACECRAWL_CONFIG: {}", self.config_path.display());
        tracing::info!("  DATA_DIR: {}", self.data_dir.display());
        tracing::info!("  TARGETS_CSV: {}", self.targets_path.display());
        tracing::info!(
            "  BROWSERLESS_URL: {}",
            self.browserless_url.as_deref().unwrap_or("<not set>")
        );
        tracing::info!("  BROWSERLESS_TOKEN: {}", preview_opt(&self.browserless_token));
        tracing::info!(
            "  CHROME_BIN: {}",
            self.chrome_bin.as_deref().unwrap_or("<bundled lookup>")
        );
        tracing::info!("  HEADLESS: {}", self.headless);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
