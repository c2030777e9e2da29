//! Submitter settings loaded from `send_detections.toml`.
//!
//! Values missing from the file fall back to defaults. `RF_API_TOKEN` and
//! `RF_API_URL` take precedence over the file.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::api::API_URL;
use crate::engine::{EngineConfig, RetryPolicy};
use crate::error::SubmitError;

pub const CONFIG_FILE: &str = "send_detections.toml";

const TOKEN_VAR: &str = "RF_API_TOKEN";
const URL_VAR: &str = "RF_API_URL";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitterConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Recorded Future API token.
    #[serde(default)]
    pub api_token: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Total attempts per batch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Whole-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_api_url() -> String {
    API_URL.to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: String::new(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SubmitterConfig {
    /// Load `send_detections.toml` from the working directory, then apply
    /// environment overrides.
    pub fn load() -> Result<Self, SubmitError> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Read settings from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, SubmitError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<SubmitterConfig>(&contents)?)
    }

    /// Override token and URL from `lookup` (normally the process
    /// environment). Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TOKEN_VAR).filter(|v| !v.is_empty()) {
            self.api_token = token;
        }
        if let Some(url) = lookup(URL_VAR).filter(|v| !v.is_empty()) {
            self.api_url = url;
        }
    }

    pub fn require_token(&self) -> Result<&str, SubmitError> {
        if self.api_token.trim().is_empty() {
            return Err(SubmitError::Config(format!(
                "no API token: set {TOKEN_VAR} or api_token in {CONFIG_FILE}"
            )));
        }
        Ok(&self.api_token)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
            .with_jitter(self.jitter)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            retry: self.retry_policy(),
            run_timeout: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
