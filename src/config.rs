use crate::registry::Placement;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub github_api_url: String,
    pub user_agent: String,
    pub github_token: Option<String>,
    pub check_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_download_bytes: u64,
    pub default_placement: PlacementChoice,
}

/// Placement preference stored in the config; a subfolder name is picked per mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementChoice {
    Direct,
    Subfolder,
}

impl PlacementChoice {
    pub fn to_placement(self, suggested_name: &str) -> Placement {
        match self {
            PlacementChoice::Direct => Placement::Direct,
            PlacementChoice::Subfolder => Placement::Subfolder(suggested_name.to_string()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            github_api_url: DEFAULT_GITHUB_API.to_string(),
            user_agent: format!("chromesmith/{}", env!("CARGO_PKG_VERSION")),
            github_token: None,
            check_concurrency: 4,
            max_retries: 3,
            retry_base_delay_ms: 500,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            max_download_bytes: 64 * 1024 * 1024,
            default_placement: PlacementChoice::Subfolder,
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        Self::load_or_create_in(&base_dir)
    }

    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            config.normalize();
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_in(base_dir)?;
        Ok(config)
    }

    pub fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    /// Token from `GITHUB_TOKEN` wins over the stored one.
    pub fn effective_github_token(&self) -> Option<String> {
        std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.github_token.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: MAX_BACKOFF,
        }
    }

    fn normalize(&mut self) {
        if self.check_concurrency == 0 {
            self.check_concurrency = 1;
        }
        if self.github_api_url.trim().is_empty() {
            self.github_api_url = DEFAULT_GITHUB_API.to_string();
        }
        self.github_api_url = self.github_api_url.trim_end_matches('/').to_string();
        if self.user_agent.trim().is_empty() {
            self.user_agent = AppConfig::default().user_agent;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("chromesmith"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_defaults_then_reloads_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let created = AppConfig::load_or_create_in(dir.path()).unwrap();
        assert_eq!(created.check_concurrency, 4);
        assert!(dir.path().join("config.json").exists());

        fs::write(
            dir.path().join("config.json"),
            r#"{ "check_concurrency": 0, "github_api_url": "http://localhost:9000/" }"#,
        )
        .unwrap();
        let loaded = AppConfig::load_or_create_in(dir.path()).unwrap();
        assert_eq!(loaded.check_concurrency, 1);
        assert_eq!(loaded.github_api_url, "http://localhost:9000");
        assert_eq!(loaded.max_retries, 3);
        assert_eq!(loaded.default_placement, PlacementChoice::Subfolder);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(12), Duration::from_secs(30));
    }
}
