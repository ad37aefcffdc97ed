//! Campaign configuration loaded from `autoapply.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `ANTHROPIC_API_KEY`, `AUTOAPPLY_PROVIDER_URL` and `AUTOAPPLY_PROVIDER_API_KEY`
//! take precedence over the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::answers::DEFAULT_MODEL;
use crate::breaker::BreakerConfig;
use crate::error::AppError;
use crate::limiter::RateLimit;
use crate::orchestrator::CampaignConfig;
use crate::platform::PlatformId;
use crate::pool::PoolConfig;
use crate::provider::SessionOptions;
use crate::retry::RetryPolicy;

pub const DEFAULT_PATH: &str = "autoapply.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Anthropic API key for generated answers. Empty disables the LLM answerer.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Ceiling on distinct jobs dispatched per campaign.
    #[serde(default = "default_max_total_applications")]
    pub max_total_applications: usize,

    /// Click the final submit button. Off means every ready application is
    /// left for a human as PendingReview.
    #[serde(default)]
    pub auto_submit: bool,

    /// Per-platform overrides keyed by platform name, e.g. `[rate_limits.lever]`.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub circuit_breaker: BreakerSection,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub providers: ProvidersSection,

    #[serde(default)]
    pub answers: AnswersSection,

    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,

    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,

    /// How much recorded history seeds the circuit breakers at start-up.
    #[serde(default = "default_history_window_mins")]
    pub history_window_mins: u64,

    #[serde(default = "default_outcome_log")]
    pub outcome_log: PathBuf,

    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub window_secs: u64,
    pub captcha_weight: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 300,
            max_cooldown_secs: 3_600,
            window_secs: 600,
            captcha_weight: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_age_secs: u64,
    pub max_uses: u32,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_age_secs: 30 * 60,
            max_uses: 20,
            idle_timeout_secs: 5 * 60,
            acquire_timeout_secs: 30,
            reap_interval_secs: 60,
            headless: true,
            user_agent: None,
        }
    }
}

/// Remote browser endpoints. The cloud provider is tried first, the local one
/// takes over when the cloud is unhealthy or full.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    pub cloud_url: Option<String>,
    pub cloud_api_key: Option<String>,
    pub cloud_max_sessions: usize,
    pub local_url: Option<String>,
    pub local_max_sessions: usize,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            cloud_url: None,
            cloud_api_key: None,
            cloud_max_sessions: 3,
            local_url: Some("http://127.0.0.1:9515".to_string()),
            local_max_sessions: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnswersSection {
    pub model: String,
    /// Fall back to the LLM when the profile has no pre-written answer.
    pub use_llm: bool,
}

impl Default for AnswersSection {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            use_llm: true,
        }
    }
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_total_applications() -> usize {
    50
}

fn default_requeue_delay_ms() -> u64 {
    5_000
}

fn default_max_deferrals() -> u32 {
    3
}

fn default_history_window_mins() -> u64 {
    60
}

fn default_outcome_log() -> PathBuf {
    PathBuf::from(".autoapply/outcomes.jsonl")
}

fn default_evidence_dir() -> PathBuf {
    PathBuf::from(".autoapply/evidence")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_concurrency: default_max_concurrency(),
            max_total_applications: default_max_total_applications(),
            auto_submit: false,
            rate_limits: HashMap::new(),
            retry: RetrySection::default(),
            circuit_breaker: BreakerSection::default(),
            pool: PoolSection::default(),
            providers: ProvidersSection::default(),
            answers: AnswersSection::default(),
            requeue_delay_ms: default_requeue_delay_ms(),
            max_deferrals: default_max_deferrals(),
            history_window_mins: default_history_window_mins(),
            outcome_log: default_outcome_log(),
            evidence_dir: default_evidence_dir(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from `autoapply.toml` in the current directory.
    ///
    /// A missing default file yields the defaults; a missing explicit path is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_PATH);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .map_err(AppError::from)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Environment variables win over the file. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(key) = var("ANTHROPIC_API_KEY") {
            self.api_key = key;
        }
        if let Some(url) = var("AUTOAPPLY_PROVIDER_URL") {
            self.providers.cloud_url = Some(url);
        }
        if let Some(key) = var("AUTOAPPLY_PROVIDER_API_KEY") {
            self.providers.cloud_api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrency == 0 {
            return Err(AppError::Config("max_concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.providers.cloud_url.is_none() && self.providers.local_url.is_none() {
            return Err(AppError::Config("no session provider configured".into()));
        }
        self.rate_limits().map(|_| ())
    }

    /// Rate-limit overrides keyed by platform.
    pub fn rate_limits(&self) -> Result<HashMap<PlatformId, RateLimit>, AppError> {
        self.rate_limits
            .iter()
            .map(|(name, limit)| {
                let platform = name
                    .parse::<PlatformId>()
                    .map_err(|e| AppError::Config(format!("rate_limits: {e}")))?;
                if limit.rate_per_sec.is_nan() || limit.rate_per_sec <= 0.0 || limit.burst == 0 {
                    return Err(AppError::Config(format!(
                        "rate_limits.{name}: rate_per_sec and burst must be positive"
                    )));
                }
                Ok((platform, *limit))
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        let cb = &self.circuit_breaker;
        BreakerConfig {
            failure_threshold: cb.failure_threshold,
            cooldown: Duration::from_secs(cb.cooldown_secs),
            max_cooldown: Duration::from_secs(cb.max_cooldown_secs.max(cb.cooldown_secs)),
            window: Duration::from_secs(cb.window_secs),
            captcha_weight: cb.captcha_weight,
        }
    }

    pub fn pool(&self) -> PoolConfig {
        let p = &self.pool;
        PoolConfig {
            max_age: Duration::from_secs(p.max_age_secs),
            max_uses: p.max_uses,
            idle_timeout: Duration::from_secs(p.idle_timeout_secs),
            acquire_timeout: Duration::from_secs(p.acquire_timeout_secs),
            reap_interval: Duration::from_secs(p.reap_interval_secs),
            options: SessionOptions {
                headless: p.headless,
                user_agent: p.user_agent.clone(),
            },
        }
    }

    pub fn campaign(&self) -> CampaignConfig {
        CampaignConfig {
            max_concurrency: self.max_concurrency,
            max_total_applications: self.max_total_applications,
            retry: self.retry_policy(),
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            max_deferrals: self.max_deferrals,
            history_window: Duration::from_secs(self.history_window_mins * 60),
        }
    }
}
