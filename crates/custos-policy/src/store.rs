//! Reloadable policy store
//!
//! Serves the current [`GovernanceConfig`] from a TTL cache backed by a
//! [`PolicySource`]. A failed reload keeps serving the last known good
//! version.

use crate::config::GovernanceConfig;
use crate::error::{PolicyError, Result};
use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default time a loaded policy is served before the source is consulted again
pub const DEFAULT_POLICY_TTL: Duration = Duration::from_secs(30);

/// Where governance policy comes from
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Load the current policy
    async fn load(&self) -> Result<GovernanceConfig>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// In-process policy, replaceable at runtime
#[derive(Debug)]
pub struct StaticPolicySource {
    config: RwLock<GovernanceConfig>,
}

impl StaticPolicySource {
    /// Create new source serving `config`
    #[must_use]
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace the served policy
    pub fn set(&self, config: GovernanceConfig) {
        *self.config.write() = config;
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn load(&self) -> Result<GovernanceConfig> {
        Ok(self.config.read().clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Policy read from a YAML or TOML file
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
    env_overrides: bool,
}

impl FilePolicySource {
    /// Create new file source
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_overrides: true,
        }
    }

    /// With or without `CUSTOS_*` environment overrides
    #[inline]
    #[must_use]
    pub fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn load(&self) -> Result<GovernanceConfig> {
        let input = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PolicyError::io(&self.path, e))?;
        let mut config = GovernanceConfig::parse_for_path(&self.path, &input)?;
        if self.env_overrides {
            config.apply_env_overrides()?;
        }
        Ok(config)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Versioned, TTL-cached policy
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,
    cache: Cache<(), Arc<GovernanceConfig>>,
    last_good: RwLock<Option<Arc<GovernanceConfig>>>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("source", &self.source.describe())
            .field("version", &self.last_good.read().as_ref().map(|c| c.version))
            .finish()
    }
}

impl PolicyStore {
    /// Create new store with the default TTL
    #[must_use]
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self::with_ttl(source, DEFAULT_POLICY_TTL)
    }

    /// Create new store with a custom TTL
    #[must_use]
    pub fn with_ttl(source: Arc<dyn PolicySource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
            last_good: RwLock::new(None),
        }
    }

    /// Store serving a fixed policy
    #[must_use]
    pub fn fixed(config: GovernanceConfig) -> Self {
        Self::new(Arc::new(StaticPolicySource::new(config)))
    }

    /// Current policy, reloading once the TTL has passed
    ///
    /// # Errors
    /// Returns the source error only if no policy was ever loaded
    pub async fn current(&self) -> Result<Arc<GovernanceConfig>> {
        if let Some(config) = self.cache.get(&()).await {
            return Ok(config);
        }
        self.reload().await
    }

    /// Force a reload from the source
    ///
    /// # Errors
    /// Returns the source or validation error only if no policy was ever loaded
    pub async fn reload(&self) -> Result<Arc<GovernanceConfig>> {
        let loaded = match self.source.load().await {
            Ok(config) => config.validate().map(|()| config),
            Err(e) => Err(e),
        };

        match loaded {
            Ok(config) => {
                let config = Arc::new(config);
                let previous = self.last_good.write().replace(Arc::clone(&config));
                match previous {
                    Some(prev) if prev.version != config.version => tracing::info!(
                        source = %self.source.describe(),
                        from = prev.version,
                        to = config.version,
                        "governance policy version changed"
                    ),
                    None => tracing::info!(
                        source = %self.source.describe(),
                        version = config.version,
                        "governance policy loaded"
                    ),
                    Some(_) => {}
                }
                self.cache.insert((), Arc::clone(&config)).await;
                Ok(config)
            }
            Err(err) => {
                let fallback = self.last_good.read().clone();
                match fallback {
                    Some(config) => {
                        tracing::warn!(
                            source = %self.source.describe(),
                            version = config.version,
                            error = %err,
                            "policy reload failed, keeping last known good"
                        );
                        metrics::counter!("custos_policy_reload_failures_total").increment(1);
                        self.cache.insert((), Arc::clone(&config)).await;
                        Ok(config)
                    }
                    None => {
                        tracing::error!(
                            source = %self.source.describe(),
                            error = %err,
                            "no governance policy available"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    /// Version of the last successfully loaded policy
    #[must_use]
    pub fn loaded_version(&self) -> Option<u64> {
        self.last_good.read().as_ref().map(|c| c.version)
    }
}
