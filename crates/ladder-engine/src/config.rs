//! Engine configuration.
//!
//! [`EngineConfig`] has working defaults and can be layered from an optional
//! TOML file and `LADDER_`-prefixed environment variables, with `__` between
//! nested keys (`LADDER_RETRY__MAX_ATTEMPTS=5`).

use std::path::Path;
use std::time::Duration;

use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use ladder_core::catalog::{StaticCatalog, TrackPrices};
use ladder_core::constants::{
    DEFAULT_CURRENCY, DEFAULT_MAX_CASCADE_STEPS, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_MAX_SCAN_DEPTH,
};
use ladder_core::types::MemberId;

use crate::error::ConfigError;

/// Where a tier-N fee goes when the member has no N-th ancestor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoAncestorRoute {
    #[default]
    Pool,
    FallbackAccount,
}

/// Backoff for transient storage failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries per step, including the first.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_backoff_ms: 10, max_backoff_ms: 1_000 }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, base_backoff_ms: 0, max_backoff_ms: 0 }
    }

    /// Exponential backoff ceiling for the given zero-based retry.
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let ms = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Account paid when a fee has no referrer or ancestor to go to.
    pub fallback_account: Option<MemberId>,
    /// Currency code passed to direct payouts.
    pub currency: String,
    /// Levels the overflow search may descend below its start.
    pub max_scan_depth: u32,
    pub no_ancestor_route: NoAncestorRoute,
    /// Steps one cascade may run before the rest is parked as unresolved.
    pub max_cascade_steps: usize,
    /// Re-evaluations of a step after a commit-time conflict.
    pub max_conflict_retries: u32,
    pub retry: RetryPolicy,
    /// Log filter, e.g. "info" or "ladder_engine=debug".
    pub log_level: String,
    /// Tier prices for [`StaticCatalog`]; empty when pricing is external.
    pub tracks: Vec<TrackPrices>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback_account: None,
            currency: DEFAULT_CURRENCY.to_string(),
            max_scan_depth: DEFAULT_MAX_SCAN_DEPTH,
            no_ancestor_route: NoAncestorRoute::Pool,
            max_cascade_steps: DEFAULT_MAX_CASCADE_STEPS,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            retry: RetryPolicy::default(),
            log_level: "info".to_string(),
            tracks: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then `path` if given, then `LADDER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(env_source());
        Self::build(builder)
    }

    /// Defaults overlaid with a TOML document. Environment is not consulted.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let cfg = builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.trim().is_empty() {
            return Err(ConfigError::Invalid("currency must not be empty".into()));
        }
        if self.max_cascade_steps == 0 {
            return Err(ConfigError::Invalid("max_cascade_steps must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        if self.no_ancestor_route == NoAncestorRoute::FallbackAccount
            && self.fallback_account.is_none()
        {
            return Err(ConfigError::Invalid(
                "no_ancestor_route = fallback-account needs fallback_account".into(),
            ));
        }
        Ok(())
    }

    /// Catalog built from [`tracks`](Self::tracks).
    pub fn catalog(&self) -> Result<StaticCatalog, ConfigError> {
        StaticCatalog::from_config(&self.tracks).map_err(|e| ConfigError::Invalid(format!("tier price: {e}")))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("LADDER")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
