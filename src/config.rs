use crate::backend::browser::selectors::BrowserSelectors;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Application settings, read from `config.json`.
///
/// Credentials are deliberately absent: they travel with each brief.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    #[serde(default = "default_threads")]
    pub default_threads: usize,
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub browser: BrowserSettings,
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_text_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_vision_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_video_model() -> String {
    "veo-3.1-fast-generate-preview".to_string()
}

fn default_threads() -> usize {
    1
}

fn default_history_file() -> PathBuf {
    PathBuf::from("history/video_history.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            text_model: default_text_model(),
            vision_model: default_vision_model(),
            video_model: default_video_model(),
            default_threads: default_threads(),
            history_file: default_history_file(),
            retry: RetrySettings::default(),
            polling: PollingSettings::default(),
            browser: BrowserSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 5.0,
            max_delay_secs: 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_secs: f64,
    pub max_attempts: u32,
    pub initial_segment_secs: u32,
    pub extension_step_secs: u32,
    pub max_extended_secs: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10.0,
            max_attempts: 60,
            initial_segment_secs: 8,
            extension_step_secs: 7,
            max_extended_secs: 141,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub target_url: String,
    /// Redirects to this host mean the injected session was rejected.
    pub sign_in_host: String,
    pub headless: bool,
    pub page_load_timeout_secs: f64,
    pub login_check_secs: f64,
    pub login_retry_interval_secs: f64,
    pub submit_enable_timeout_secs: f64,
    pub submit_poll_interval_secs: f64,
    pub render_timeout_secs: f64,
    pub render_poll_interval_secs: f64,
    pub settle_delay_secs: f64,
    pub selectors: BrowserSelectors,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            target_url: "https://labs.google/fx/tools/flow".to_string(),
            sign_in_host: "accounts.google.com".to_string(),
            headless: true,
            page_load_timeout_secs: 60.0,
            login_check_secs: 15.0,
            login_retry_interval_secs: 2.0,
            submit_enable_timeout_secs: 30.0,
            submit_poll_interval_secs: 1.0,
            render_timeout_secs: 120.0,
            render_poll_interval_secs: 3.0,
            settle_delay_secs: 0.5,
            selectors: BrowserSelectors::default(),
        }
    }
}

impl BrowserSettings {
    pub fn page_load_timeout(&self) -> Duration {
        secs(self.page_load_timeout_secs)
    }

    pub fn login_check(&self) -> Duration {
        secs(self.login_check_secs)
    }

    pub fn login_retry_interval(&self) -> Duration {
        secs(self.login_retry_interval_secs)
    }

    pub fn submit_enable_timeout(&self) -> Duration {
        secs(self.submit_enable_timeout_secs)
    }

    pub fn submit_poll_interval(&self) -> Duration {
        secs(self.submit_poll_interval_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        secs(self.render_timeout_secs)
    }

    pub fn render_poll_interval(&self) -> Duration {
        secs(self.render_poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        secs(self.settle_delay_secs)
    }

    /// Render polls that fit in the wall-clock ceiling.
    pub fn render_poll_attempts(&self) -> u32 {
        let interval = self.render_poll_interval_secs.max(0.001);
        (self.render_timeout_secs / interval).ceil().max(1.0) as u32
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file falls back to defaults; a broken file is still an error.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if fs::metadata(&path).await.is_err() {
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_threads == 0 {
            anyhow::bail!("config.json: default_threads must be at least 1");
        }
        if self.polling.max_attempts == 0 {
            anyhow::bail!("config.json: polling.max_attempts must be at least 1");
        }
        if self.polling.extension_step_secs == 0 {
            anyhow::bail!("config.json: polling.extension_step_secs must be positive");
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            anyhow::bail!("config.json: retry.max_delay_secs is smaller than base_delay_secs");
        }
        Ok(())
    }
}
