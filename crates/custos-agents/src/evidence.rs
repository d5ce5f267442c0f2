//! Evidence gathering and scoring for disputes
//!
//! Gathering and scoring both go through the `evidence` breaker and are
//! retried with bounded backoff on transport failures. Scores are averaged per
//! sub-check; a missing sub-check counts as the worst score.

use crate::store::DisputeRecord;
use async_trait::async_trait;
use custos_core::{
    BreakerConfig, CallError, CircuitBreaker, ConfidenceScorer, EvidenceItem, EvidenceKind,
    PortError, RetryPolicy,
};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Weight of authenticity in the confidence
pub const AUTHENTICITY_WEIGHT: f64 = 0.4;
/// Weight of consistency in the confidence
pub const CONSISTENCY_WEIGHT: f64 = 0.4;
/// Weight of the absence of damage in the confidence
pub const DAMAGE_WEIGHT: f64 = 0.2;

/// Where dispute evidence comes from
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Collect evidence for `dispute`
    async fn gather(&self, dispute: &DisputeRecord) -> Result<Vec<EvidenceItem>, PortError>;
}

/// Per sub-check scores, each in `0.0..=100.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvidenceScores {
    /// Mean authenticity score
    pub authenticity: f64,
    /// Mean consistency score
    pub consistency: f64,
    /// Mean damage score
    pub damage: f64,
    /// Items scored
    pub items: usize,
    /// Consistency items among `items`; zero means the score is the missing default
    #[serde(default)]
    pub consistency_items: usize,
}

impl EvidenceScores {
    /// Weighted confidence in `0.0..=100.0`
    #[must_use]
    pub fn confidence(&self) -> f64 {
        self.authenticity * AUTHENTICITY_WEIGHT
            + self.consistency * CONSISTENCY_WEIGHT
            + (100.0 - self.damage) * DAMAGE_WEIGHT
    }

    /// Check whether any consistency evidence was scored
    #[inline]
    #[must_use]
    pub fn has_consistency(&self) -> bool {
        self.consistency_items > 0
    }

    /// Aggregate scored items
    #[must_use]
    pub fn from_scored(scored: &[(EvidenceKind, f64)]) -> Self {
        let mean = |kind: EvidenceKind, missing: f64| {
            let values: Vec<f64> = scored
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, score)| *score)
                .collect();
            if values.is_empty() {
                missing
            } else {
                #[allow(clippy::cast_precision_loss)]
                let count = values.len() as f64;
                values.iter().sum::<f64>() / count
            }
        };
        Self {
            authenticity: mean(EvidenceKind::Authenticity, 0.0),
            consistency: mean(EvidenceKind::Consistency, 0.0),
            damage: mean(EvidenceKind::Damage, 100.0),
            items: scored.len(),
            consistency_items: scored
                .iter()
                .filter(|(kind, _)| *kind == EvidenceKind::Consistency)
                .count(),
        }
    }
}

/// Gathers and scores evidence
pub struct EvidenceGatherer {
    source: Arc<dyn EvidenceSource>,
    scorer: Arc<dyn ConfidenceScorer>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for EvidenceGatherer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceGatherer")
            .field("breaker", &self.breaker.name())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EvidenceGatherer {
    /// Create new gatherer with a default `evidence` breaker
    #[must_use]
    pub fn new(source: Arc<dyn EvidenceSource>, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        Self {
            source,
            scorer,
            breaker: Arc::new(CircuitBreaker::new("evidence", BreakerConfig::default())),
            retry: RetryPolicy::default(),
        }
    }

    /// With shared breaker
    #[inline]
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Gather and score evidence for `dispute`
    ///
    /// # Errors
    /// Returns the last collaborator error once retries are spent, or
    /// `PortError::InvalidResponse` for an out-of-range score
    pub async fn collect(&self, dispute: &DisputeRecord) -> Result<EvidenceScores, PortError> {
        let breaker = self.breaker.as_ref();
        let source = self.source.as_ref();
        let items = self
            .retry
            .run(
                "evidence.gather",
                move || breaker.call(source.gather(dispute)),
                is_transient,
            )
            .await
            .map_err(into_port_error)?;

        let scored = try_join_all(items.iter().map(|item| self.score(item))).await?;
        let scores = EvidenceScores::from_scored(&scored);
        tracing::debug!(
            dispute = %dispute.id,
            items = scores.items,
            authenticity = scores.authenticity,
            consistency = scores.consistency,
            damage = scores.damage,
            "evidence scored"
        );
        Ok(scores)
    }

    async fn score(&self, item: &EvidenceItem) -> Result<(EvidenceKind, f64), PortError> {
        let breaker = self.breaker.as_ref();
        let scorer = self.scorer.as_ref();
        let score = self
            .retry
            .run(
                "evidence.score",
                move || breaker.call(scorer.score(item)),
                is_transient,
            )
            .await
            .map_err(into_port_error)?;
        if !(0.0..=100.0).contains(&score) {
            return Err(PortError::invalid(
                "scorer",
                format!("score {score} for {} is outside 0-100", item.source),
            ));
        }
        Ok((item.kind, score))
    }
}

fn is_transient(err: &CallError<PortError>) -> bool {
    match err {
        CallError::Open { .. } => false,
        CallError::Timeout { .. } => true,
        CallError::Inner(inner) => inner.is_retryable(),
    }
}

fn into_port_error(err: CallError<PortError>) -> PortError {
    match err {
        CallError::Inner(inner) => inner,
        CallError::Open { name } => PortError::unavailable(name, "circuit open"),
        CallError::Timeout { name, .. } => PortError::Timeout { service: name },
    }
}
