//! Process configuration
//!
//! One document covers every service the binary wires together. The
//! governance policy is either inline under `policy` or loaded from
//! `policy_path` (reloaded after `policy_ttl_secs`). Files may be YAML or
//! TOML; `CUSTOS_*` environment variables override individual fields.

use crate::cost::CostConfig;
use crate::error::{Result, SwarmError};
use crate::orchestrator::SwarmConfig;
use custos_agents::{DisputeConfig, FailoverConfig};
use custos_core::{BreakerConfig, RetryPolicy, TelemetryConfig};
use custos_policy::{GovernanceConfig, DEFAULT_POLICY_TTL};
use custos_veto::VetoConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Breakers guarding each external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
    pub ledger: BreakerConfig,
    pub evidence: BreakerConfig,
    pub health: BreakerConfig,
}

/// Everything the `custos` binary needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustosConfig {
    /// External policy file; `policy` is used when absent
    pub policy_path: Option<PathBuf>,
    /// How long a loaded policy is served before re-reading the file
    pub policy_ttl_secs: u64,
    pub policy: GovernanceConfig,
    /// SQLite file for veto sessions; in memory when absent
    pub database_path: Option<PathBuf>,
    pub veto: VetoConfig,
    pub failover: FailoverConfig,
    pub dispute: DisputeConfig,
    pub swarm: SwarmConfig,
    pub cost: CostConfig,
    pub breakers: BreakersConfig,
    pub retry: RetryPolicy,
    pub telemetry: TelemetryConfig,
}

impl Default for CustosConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            policy_ttl_secs: DEFAULT_POLICY_TTL.as_secs(),
            policy: GovernanceConfig::default(),
            database_path: None,
            veto: VetoConfig::default(),
            failover: FailoverConfig::default(),
            dispute: DisputeConfig::default(),
            swarm: SwarmConfig::default(),
            cost: CostConfig::default(),
            breakers: BreakersConfig::default(),
            retry: RetryPolicy::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl CustosConfig {
    /// With inline policy
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: GovernanceConfig) -> Self {
        self.policy = policy;
        self
    }

    /// With swarm thresholds
    #[inline]
    #[must_use]
    pub fn with_swarm(mut self, swarm: SwarmConfig) -> Self {
        self.swarm = swarm;
        self
    }

    /// With database file
    #[inline]
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn policy_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_ttl_secs)
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    /// Returns `SwarmError::Config` or the policy validation error
    pub fn validate(&self) -> Result<()> {
        if self.policy_path.is_none() {
            self.policy.validate()?;
        }
        if self.swarm.failure_threshold == 0 || self.swarm.fraud_threshold == 0 {
            return Err(SwarmError::config("swarm thresholds must be positive"));
        }
        if self.swarm.window_secs == 0 {
            return Err(SwarmError::config("swarm.window_secs must be positive"));
        }
        if self.cost.batch_size == 0 {
            return Err(SwarmError::config("cost.batch_size must be positive"));
        }
        if !(0.0..=100.0).contains(&self.dispute.escalation_floor)
            || self.dispute.escalation_floor > self.dispute.auto_resolve_threshold
            || self.dispute.auto_resolve_threshold > 100.0
        {
            return Err(SwarmError::config(
                "dispute thresholds must satisfy 0 <= escalation_floor <= auto_resolve_threshold <= 100",
            ));
        }
        for (name, breaker) in [
            ("ledger", &self.breakers.ledger),
            ("evidence", &self.breakers.evidence),
            ("health", &self.breakers.health),
        ] {
            breaker
                .validate()
                .map_err(|e| SwarmError::config(format!("breakers.{name}: {e}")))?;
        }
        if self.retry.max_attempts == 0 {
            return Err(SwarmError::config("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Parse according to the extension of `path`
    ///
    /// # Errors
    /// Returns `SwarmError::Config` for unknown extensions or malformed input
    pub fn parse_for_path(path: &Path, input: &str) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(input)
                .map_err(|e| SwarmError::config(format!("yaml: {e}"))),
            Some("toml") => {
                toml::from_str(input).map_err(|e| SwarmError::config(format!("toml: {e}")))
            }
            other => Err(SwarmError::config(format!(
                "unsupported config format: '{}'",
                other.unwrap_or_default()
            ))),
        }
    }

    /// Read, parse, override from the environment and validate
    ///
    /// # Errors
    /// Returns IO, parse, override or validation errors
    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|source| SwarmError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse_for_path(path, &input)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CUSTOS_*` overrides from the process environment
    ///
    /// # Errors
    /// Returns `SwarmError::Config` when a value does not parse
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CUSTOS_*` overrides from an arbitrary lookup
    ///
    /// Besides the policy keys, recognises `CUSTOS_POLICY_PATH`,
    /// `CUSTOS_POLICY_TTL_SECS`, `CUSTOS_DATABASE_PATH`,
    /// `CUSTOS_SWARM_{FAILURE_THRESHOLD,FRAUD_THRESHOLD,WINDOW_SECS}`,
    /// `CUSTOS_DISPUTE_{AUTO_RESOLVE_THRESHOLD,AMOUNT_CEILING}`,
    /// `CUSTOS_FAILOVER_RISK_THRESHOLD`, `CUSTOS_COST_BATCH_SIZE` and
    /// `CUSTOS_LOG_JSON`.
    ///
    /// # Errors
    /// Returns `SwarmError::Config` when a value does not parse
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        self.policy.apply_overrides(&lookup)?;
        if let Some(path) = lookup("CUSTOS_POLICY_PATH") {
            self.policy_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(path) = lookup("CUSTOS_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path.trim()));
        }
        override_value(&lookup, "CUSTOS_POLICY_TTL_SECS", &mut self.policy_ttl_secs)?;
        override_value(
            &lookup,
            "CUSTOS_SWARM_FAILURE_THRESHOLD",
            &mut self.swarm.failure_threshold,
        )?;
        override_value(
            &lookup,
            "CUSTOS_SWARM_FRAUD_THRESHOLD",
            &mut self.swarm.fraud_threshold,
        )?;
        override_value(&lookup, "CUSTOS_SWARM_WINDOW_SECS", &mut self.swarm.window_secs)?;
        override_value(
            &lookup,
            "CUSTOS_DISPUTE_AUTO_RESOLVE_THRESHOLD",
            &mut self.dispute.auto_resolve_threshold,
        )?;
        override_value(
            &lookup,
            "CUSTOS_DISPUTE_AMOUNT_CEILING",
            &mut self.dispute.amount_ceiling,
        )?;
        override_value(
            &lookup,
            "CUSTOS_FAILOVER_RISK_THRESHOLD",
            &mut self.failover.risk_threshold,
        )?;
        override_value(&lookup, "CUSTOS_COST_BATCH_SIZE", &mut self.cost.batch_size)?;
        override_value(&lookup, "CUSTOS_LOG_JSON", &mut self.telemetry.json)?;
        Ok(())
    }

    /// Render as YAML
    ///
    /// # Errors
    /// Returns `SwarmError::Config` if serialization fails
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| SwarmError::config(format!("yaml: {e}")))
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns `SwarmError::Config` if serialization fails
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SwarmError::config(format!("toml: {e}")))
    }
}

fn override_value<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| SwarmError::config(format!("invalid override {key}='{raw}': {e}")))?;
        tracing::debug!(key, value = %raw, "applied config override");
    }
    Ok(())
}
