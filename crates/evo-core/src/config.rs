//! Engine tuning and campaign config files.

use std::path::Path;
use std::time::Duration;

use evo_state::CampaignConfig;

use crate::error::{EngineError, EngineResult};

/// Execution knobs shared by every round the engine runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Concurrent generation calls per round.
    pub generation_pool: usize,
    /// Concurrent (variant, evaluator) calls per round.
    pub evaluation_pool: usize,
    /// Timeout applied to every external capability call.
    pub call_timeout: Duration,
    /// Attempts per capability call, including the first.
    pub max_attempts: u32,
    /// Backoff before attempt `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    /// Lifetime of a round execution lease; renewed at a third of this.
    pub lease_ttl: Duration,
    /// How often a caller that lost the lease re-reads the round.
    pub lease_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_pool: 4,
            evaluation_pool: 8,
            call_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            lease_ttl: Duration::from_secs(30),
            lease_poll: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables
    ///
    /// Reads:
    /// - EVO_GENERATION_POOL
    /// - EVO_EVALUATION_POOL
    /// - EVO_CALL_TIMEOUT_MS
    /// - EVO_MAX_ATTEMPTS
    /// - EVO_RETRY_BACKOFF_MS
    /// - EVO_LEASE_TTL_MS
    /// - EVO_LEASE_POLL_MS
    ///
    /// Unparseable values are rejected rather than ignored.
    pub fn from_env() -> EngineResult<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("EVO_GENERATION_POOL")? {
            cfg.generation_pool = v;
        }
        if let Some(v) = env_parse::<usize>("EVO_EVALUATION_POOL")? {
            cfg.evaluation_pool = v;
        }
        if let Some(v) = env_parse::<u64>("EVO_CALL_TIMEOUT_MS")? {
            cfg.call_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("EVO_MAX_ATTEMPTS")? {
            cfg.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("EVO_RETRY_BACKOFF_MS")? {
            cfg.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("EVO_LEASE_TTL_MS")? {
            cfg.lease_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("EVO_LEASE_POLL_MS")? {
            cfg.lease_poll = Duration::from_millis(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.generation_pool == 0 || self.evaluation_pool == 0 {
            return Err(EngineError::InvalidConfig(
                "worker pool sizes must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.lease_ttl.is_zero() {
            return Err(EngineError::InvalidConfig("lease_ttl must be positive".into()));
        }
        Ok(())
    }

    /// Small pools and short timers for tests and the CLI demo.
    pub fn fast() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(5),
            lease_ttl: Duration::from_secs(5),
            lease_poll: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> EngineResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::InvalidConfig(format!("{name}={raw} is not valid"))),
        Err(_) => Ok(None),
    }
}

/// Parse a campaign config from TOML text and validate it.
pub fn parse_campaign_config(text: &str) -> EngineResult<CampaignConfig> {
    let config: CampaignConfig =
        toml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
    config.validate().map_err(EngineError::InvalidConfig)?;
    Ok(config)
}

/// Load a campaign config from a TOML file.
pub fn load_campaign_config(path: &Path) -> EngineResult<CampaignConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_campaign_config(&text)
}
