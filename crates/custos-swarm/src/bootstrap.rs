//! Service wiring
//!
//! Every service is built once from a [`CustosConfig`] and the collaborator
//! [`Ports`], then shared through `Arc`s. Agents publish into the
//! orchestrator's channel, so the channel is created before them.

use crate::config::CustosConfig;
use crate::cost::{CostMeter, CostSink};
use crate::error::Result;
use crate::orchestrator::{SwarmHandle, SwarmOrchestrator};
use custos_agents::{
    DisputeAgent, EvidenceGatherer, EvidenceSource, FailoverAgent, GovernedRunner, RiskScanner,
    SagaExecutor, ShipmentStore,
};
use custos_core::{
    BreakerConfig, BreakerRegistry, ConfidenceScorer, CostRecorder, HealthProbe, LedgerClient,
    Notifier, SharedClock,
};
use custos_policy::{
    FilePolicySource, GovernanceEngine, PolicySource, PolicyStore, StaticPolicySource,
};
use custos_veto::{InMemoryVetoRepository, SqliteVetoRepository, VetoRepository, VetoService};
use std::sync::Arc;

/// Collaborators supplied by the embedding process
pub struct Ports {
    pub store: Arc<dyn ShipmentStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub evidence: Arc<dyn EvidenceSource>,
    pub scorer: Arc<dyn ConfidenceScorer>,
    pub health: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notifier>,
    pub cost_sink: Arc<dyn CostSink>,
    pub clock: SharedClock,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Wired services
pub struct Services {
    pub config: CustosConfig,
    pub store: Arc<dyn ShipmentStore>,
    pub policy: Arc<PolicyStore>,
    pub engine: Arc<GovernanceEngine>,
    pub veto: VetoService,
    pub paolo: Arc<FailoverAgent>,
    pub giulia: Arc<DisputeAgent>,
    pub runner: GovernedRunner,
    pub swarm: Arc<SwarmOrchestrator>,
    pub cost: Arc<CostMeter>,
    pub breakers: BreakerRegistry,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Build every service and recover open veto windows
    ///
    /// # Errors
    /// Returns config validation, database or recovery errors
    pub async fn bootstrap(config: CustosConfig, ports: Ports) -> Result<Self> {
        config.validate()?;

        let breakers = BreakerRegistry::new(BreakerConfig::default());
        let ledger_breaker = breakers.register("ledger", config.breakers.ledger.clone());
        let evidence_breaker = breakers.register("evidence", config.breakers.evidence.clone());
        let health_breaker = breakers.register("health", config.breakers.health.clone());

        let source: Arc<dyn PolicySource> = match &config.policy_path {
            Some(path) => Arc::new(FilePolicySource::new(path.clone()).with_env_overrides(true)),
            None => Arc::new(StaticPolicySource::new(config.policy.clone())),
        };
        tracing::info!(policy = %source.describe(), ttl_secs = config.policy_ttl_secs, "policy source");
        let policy = Arc::new(PolicyStore::with_ttl(source, config.policy_ttl()));
        let engine = Arc::new(
            GovernanceEngine::new(policy.clone())
                .with_health_probe(ports.health.clone())
                .with_breaker(health_breaker)
                .with_retry(config.retry.clone()),
        );

        let repo: Arc<dyn VetoRepository> = match &config.database_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "veto sessions on sqlite");
                Arc::new(SqliteVetoRepository::new(path)?)
            }
            None => Arc::new(InMemoryVetoRepository::new()),
        };
        let veto = VetoService::builder(repo)
            .clock(ports.clock.clone())
            .config(config.veto.clone())
            .notifier(ports.notifier.clone())
            .build();
        let recovered = veto.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "re-armed open veto windows");
        }

        let cost = Arc::new(CostMeter::spawn(ports.cost_sink.clone(), config.cost.clone()));
        let recorder: Arc<dyn CostRecorder> = cost.clone();
        let (sender, receiver) = SwarmOrchestrator::channel();

        let executor = Arc::new(
            SagaExecutor::new(ports.store.clone(), ports.ledger.clone())
                .with_breaker(ledger_breaker)
                .with_clock(ports.clock.clone())
                .with_cost(recorder.clone()),
        );
        let paolo = Arc::new(
            FailoverAgent::new(executor.clone(), sender.clone()).with_config(config.failover.clone()),
        );
        let evidence = EvidenceGatherer::new(ports.evidence.clone(), ports.scorer.clone())
            .with_breaker(evidence_breaker)
            .with_retry(config.retry.clone());
        let giulia = Arc::new(
            DisputeAgent::new(executor, evidence, sender.clone())
                .with_config(config.dispute.clone())
                .with_cost(recorder),
        );

        let runner = GovernedRunner::new(engine.clone(), veto.clone(), sender.clone())
            .with_notifier(ports.notifier.clone())
            .with_clock(ports.clock.clone());
        let swarm = Arc::new(
            SwarmOrchestrator::new(sender, receiver, paolo.clone(), config.swarm.clone())
                .with_clock(ports.clock.clone()),
        );

        tracing::info!(version = crate::VERSION, "custos services ready");
        Ok(Self {
            config,
            store: ports.store,
            policy,
            engine,
            veto,
            paolo,
            giulia,
            runner,
            swarm,
            cost,
            breakers,
        })
    }

    /// Start the orchestrator loop
    ///
    /// # Errors
    /// Returns `SwarmError::Stopped` if it was already started
    pub fn start(&self) -> Result<SwarmHandle> {
        self.swarm.clone().spawn()
    }

    /// Background risk scanner on the configured interval
    #[must_use]
    pub fn risk_scanner(&self) -> RiskScanner {
        RiskScanner::new(self.paolo.clone(), self.runner.clone())
    }

    /// Drain the orchestrator, flush costs and cancel veto timers
    pub async fn shutdown(&self, swarm: SwarmHandle) {
        swarm.shutdown().await;
        self.cost.shutdown().await;
        self.veto.shutdown();
        tracing::info!("custos services stopped");
    }
}
