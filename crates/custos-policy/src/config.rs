//! Governance configuration
//!
//! A single versioned document holds every threshold the engine reads:
//! - Per-agent amount bands and veto timeouts
//! - The health floor below which degraded supervision is tolerated
//! - Calendar rules (business hours, weekends, holidays)
//! - The dispute fast-track rule
//!
//! Loaded from YAML or TOML; `CUSTOS_*` environment variables override
//! individual knobs after parsing.

use crate::error::{PolicyError, Result};
use chrono::NaiveDate;
use custos_core::{AgentKind, Money};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Amount bands and veto timeout for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThresholds {
    /// Highest amount executed without supervision
    pub full_auto_max: Money,
    /// Highest amount executed after an unanswered veto window
    pub veto_window_max: Money,
    /// Lowest amount requiring two approvals
    pub dual_control_min: Money,
    /// Veto window length
    pub veto_timeout_secs: u64,
}

impl AgentThresholds {
    /// Carrier-failover defaults
    #[must_use]
    pub fn paolo() -> Self {
        Self {
            full_auto_max: Money::from_euros(5_000),
            veto_window_max: Money::from_euros(10_000),
            dual_control_min: Money::from_euros(50_000),
            veto_timeout_secs: 60,
        }
    }

    /// Dispute-resolution defaults
    #[must_use]
    pub fn giulia() -> Self {
        Self {
            full_auto_max: Money::from_euros(1_000),
            veto_window_max: Money::from_euros(2_500),
            dual_control_min: Money::from_euros(10_000),
            veto_timeout_secs: 300,
        }
    }

    /// Veto window as a duration
    #[inline]
    #[must_use]
    pub fn veto_timeout(&self) -> Duration {
        Duration::from_secs(self.veto_timeout_secs)
    }

    fn validate(&self, agent: AgentKind) -> Result<()> {
        if self.full_auto_max > self.veto_window_max {
            return Err(PolicyError::Invalid(format!(
                "{agent}: full_auto_max {} exceeds veto_window_max {}",
                self.full_auto_max, self.veto_window_max
            )));
        }
        if self.veto_window_max >= self.dual_control_min {
            return Err(PolicyError::Invalid(format!(
                "{agent}: veto_window_max {} must be below dual_control_min {}",
                self.veto_window_max, self.dual_control_min
            )));
        }
        if self.veto_timeout_secs == 0 {
            return Err(PolicyError::Invalid(format!(
                "{agent}: veto_timeout_secs must be positive"
            )));
        }
        Ok(())
    }
}

/// Business-hours and restricted-day rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarRules {
    /// Apply calendar restrictions at all
    pub enabled: bool,
    /// First business hour (local, inclusive)
    pub business_start_hour: u32,
    /// End of business (local, exclusive)
    pub business_end_hour: u32,
    /// Local offset from UTC in minutes
    pub utc_offset_minutes: i32,
    /// Saturdays and Sundays require pre-authorization
    pub weekend_restricted: bool,
    /// Local dates treated as restricted
    pub holidays: Vec<NaiveDate>,
}

impl Default for CalendarRules {
    fn default() -> Self {
        Self {
            enabled: true,
            business_start_hour: 8,
            business_end_hour: 20,
            utc_offset_minutes: 60,
            weekend_restricted: true,
            holidays: Vec::new(),
        }
    }
}

impl CalendarRules {
    /// Calendar rules that never restrict
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// With UTC offset
    #[inline]
    #[must_use]
    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// With an additional holiday
    #[inline]
    #[must_use]
    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.push(date);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.business_start_hour >= self.business_end_hour || self.business_end_hour > 24 {
            return Err(PolicyError::Invalid(format!(
                "business hours {}..{} are not a valid window",
                self.business_start_hour, self.business_end_hour
            )));
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(PolicyError::Invalid(format!(
                "utc offset {} minutes is out of range",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }
}

/// Dispute fast-track: high-confidence mid-value disputes get a veto window
/// instead of pre-authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastTrack {
    /// Minimum confidence (0.0-1.0)
    pub min_confidence: f64,
    /// Highest amount eligible
    pub max_amount: Money,
    /// Veto window granted
    pub timeout_secs: u64,
}

impl Default for FastTrack {
    fn default() -> Self {
        Self {
            min_confidence: 0.95,
            max_amount: Money::from_euros(3_000),
            timeout_secs: 300,
        }
    }
}

/// Versioned governance policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Monotonic policy version
    pub version: u64,
    /// Master switch; disabled governance lets every action run unsupervised
    pub enabled: bool,
    /// Carrier-failover thresholds
    pub paolo: AgentThresholds,
    /// Dispute-resolution thresholds
    pub giulia: AgentThresholds,
    /// Amount above which degraded supervision forces pre-authorization
    pub health_floor: Money,
    /// Calendar rules
    pub calendar: CalendarRules,
    /// Dispute fast-track rule
    pub fast_track: FastTrack,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            version: 1,
            enabled: true,
            paolo: AgentThresholds::paolo(),
            giulia: AgentThresholds::giulia(),
            health_floor: Money::from_euros(500),
            calendar: CalendarRules::default(),
            fast_track: FastTrack::default(),
        }
    }
}

impl GovernanceConfig {
    /// Thresholds for `agent`
    #[inline]
    #[must_use]
    pub fn thresholds(&self, agent: AgentKind) -> &AgentThresholds {
        match agent {
            AgentKind::Paolo => &self.paolo,
            AgentKind::Giulia => &self.giulia,
        }
    }

    fn thresholds_mut(&mut self, agent: AgentKind) -> &mut AgentThresholds {
        match agent {
            AgentKind::Paolo => &mut self.paolo,
            AgentKind::Giulia => &mut self.giulia,
        }
    }

    /// With version
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// With governance switched on or off
    #[inline]
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// With calendar rules
    #[inline]
    #[must_use]
    pub fn with_calendar(mut self, calendar: CalendarRules) -> Self {
        self.calendar = calendar;
        self
    }

    /// With thresholds for one agent
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, agent: AgentKind, thresholds: AgentThresholds) -> Self {
        *self.thresholds_mut(agent) = thresholds;
        self
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns `PolicyError::Invalid` describing the first inconsistency
    pub fn validate(&self) -> Result<()> {
        for agent in AgentKind::ALL {
            self.thresholds(agent).validate(agent)?;
        }
        self.calendar.validate()?;
        if !(0.0..=1.0).contains(&self.fast_track.min_confidence) {
            return Err(PolicyError::Invalid(format!(
                "fast_track.min_confidence {} is outside 0.0..=1.0",
                self.fast_track.min_confidence
            )));
        }
        if self.fast_track.timeout_secs == 0 {
            return Err(PolicyError::Invalid("fast_track.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Parse a YAML document
    ///
    /// # Errors
    /// Returns `PolicyError::Parse` on malformed input
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).map_err(|e| PolicyError::Parse {
            format: "yaml",
            message: e.to_string(),
        })
    }

    /// Parse a TOML document
    ///
    /// # Errors
    /// Returns `PolicyError::Parse` on malformed input
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| PolicyError::Parse {
            format: "toml",
            message: e.to_string(),
        })
    }

    /// Parse `input` according to the extension of `path`
    ///
    /// # Errors
    /// Returns `PolicyError::UnsupportedFormat` for unknown extensions
    pub fn parse_for_path(path: &Path, input: &str) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(input),
            Some("toml") => Self::from_toml_str(input),
            other => Err(PolicyError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Read and parse a policy file
    ///
    /// # Errors
    /// Returns IO or parse errors
    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| PolicyError::io(path, e))?;
        Self::parse_for_path(path, &input)
    }

    /// Apply `CUSTOS_*` overrides from the process environment
    ///
    /// # Errors
    /// Returns `PolicyError::Override` when a value does not parse
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CUSTOS_*` overrides from an arbitrary lookup
    ///
    /// Recognised keys: `CUSTOS_GOVERNANCE_ENABLED`, `CUSTOS_POLICY_VERSION`,
    /// `CUSTOS_HEALTH_FLOOR`, `CUSTOS_CALENDAR_ENABLED`,
    /// `CUSTOS_UTC_OFFSET_MINUTES`, `CUSTOS_FAST_TRACK_MIN_CONFIDENCE`,
    /// `CUSTOS_FAST_TRACK_MAX_AMOUNT`, and per agent
    /// `CUSTOS_<AGENT>_{FULL_AUTO_MAX,VETO_WINDOW_MAX,DUAL_CONTROL_MIN,VETO_TIMEOUT_SECS}`.
    ///
    /// # Errors
    /// Returns `PolicyError::Override` when a value does not parse
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_value(&lookup, "CUSTOS_GOVERNANCE_ENABLED", &mut self.enabled)?;
        override_value(&lookup, "CUSTOS_POLICY_VERSION", &mut self.version)?;
        override_value(&lookup, "CUSTOS_HEALTH_FLOOR", &mut self.health_floor)?;
        override_value(&lookup, "CUSTOS_CALENDAR_ENABLED", &mut self.calendar.enabled)?;
        override_value(
            &lookup,
            "CUSTOS_UTC_OFFSET_MINUTES",
            &mut self.calendar.utc_offset_minutes,
        )?;
        override_value(
            &lookup,
            "CUSTOS_FAST_TRACK_MIN_CONFIDENCE",
            &mut self.fast_track.min_confidence,
        )?;
        override_value(
            &lookup,
            "CUSTOS_FAST_TRACK_MAX_AMOUNT",
            &mut self.fast_track.max_amount,
        )?;

        for agent in AgentKind::ALL {
            let prefix = format!("CUSTOS_{}", agent.as_str().to_ascii_uppercase());
            let thresholds = self.thresholds_mut(agent);
            override_value(
                &lookup,
                &format!("{prefix}_FULL_AUTO_MAX"),
                &mut thresholds.full_auto_max,
            )?;
            override_value(
                &lookup,
                &format!("{prefix}_VETO_WINDOW_MAX"),
                &mut thresholds.veto_window_max,
            )?;
            override_value(
                &lookup,
                &format!("{prefix}_DUAL_CONTROL_MIN"),
                &mut thresholds.dual_control_min,
            )?;
            override_value(
                &lookup,
                &format!("{prefix}_VETO_TIMEOUT_SECS"),
                &mut thresholds.veto_timeout_secs,
            )?;
        }
        Ok(())
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
            .map_err(|e: T::Err| PolicyError::override_error(key, raw.clone(), e.to_string()))?;
        tracing::debug!(key, value = %raw, "applied policy override");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = GovernanceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.paolo.veto_timeout(), Duration::from_secs(60));
        assert_eq!(config.giulia.dual_control_min, Money::from_euros(10_000));
    }

    #[test]
    fn parses_yaml_with_partial_sections() {
        let config = GovernanceConfig::from_yaml_str(
            r"
version: 7
health_floor: 750
paolo:
  full_auto_max: 4000
  veto_window_max: '9000.50'
  dual_control_min: 40000
  veto_timeout_secs: 90
calendar:
  holidays: ['2025-12-25']
",
        )
        .unwrap();
        assert_eq!(config.version, 7);
        assert_eq!(config.health_floor, Money::from_euros(750));
        assert_eq!(config.paolo.veto_window_max, Money::from_cents(900_050));
        assert_eq!(config.giulia, AgentThresholds::giulia());
        assert_eq!(config.calendar.holidays.len(), 1);
        assert!(config.calendar.weekend_restricted);
    }

    #[test]
    fn parses_toml() {
        let config = GovernanceConfig::from_toml_str(
            r#"
version = 3
enabled = false

[giulia]
full_auto_max = "800.00"
veto_window_max = 2000
dual_control_min = 8000
veto_timeout_secs = 120
"#,
        )
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.giulia.veto_timeout_secs, 120);
        assert_eq!(config.paolo, AgentThresholds::paolo());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = GovernanceConfig::parse_for_path(Path::new("policy.json"), "{}").unwrap_err();
        assert!(matches!(err, PolicyError::UnsupportedFormat(ext) if ext == "json"));
    }

    #[test]
    fn rejects_inverted_bands() {
        let mut config = GovernanceConfig::default();
        config.paolo.veto_window_max = Money::from_euros(60_000);
        assert!(matches!(config.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn overrides_apply_per_agent() {
        let vars: HashMap<&str, &str> = [
            ("CUSTOS_PAOLO_VETO_TIMEOUT_SECS", "45"),
            ("CUSTOS_GIULIA_FULL_AUTO_MAX", "€1_500.00"),
            ("CUSTOS_CALENDAR_ENABLED", "false"),
        ]
        .into_iter()
        .collect();
        let mut config = GovernanceConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.paolo.veto_timeout_secs, 45);
        assert_eq!(config.giulia.full_auto_max, Money::from_euros(1_500));
        assert!(!config.calendar.enabled);
    }

    #[test]
    fn bad_override_reports_key() {
        let mut config = GovernanceConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CUSTOS_HEALTH_FLOOR").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CUSTOS_HEALTH_FLOOR"));
    }
}
