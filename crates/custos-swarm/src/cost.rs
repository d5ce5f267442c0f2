//! Cost metering
//!
//! Agents record one [`CostEvent`] per ledger submission and per evidence
//! gathering. The [`CostMeter`] queues them and hands batches to a
//! [`CostSink`] when the batch fills up or the flush interval elapses.

use async_trait::async_trait;
use custos_core::{CostEvent, CostKind, CostRecorder, PortError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Destination for cost batches
#[async_trait]
pub trait CostSink: Send + Sync {
    /// Persist or forward one batch
    ///
    /// # Errors
    /// Returns `PortError` if the batch could not be delivered
    async fn flush(&self, batch: Vec<CostEvent>) -> Result<(), PortError>;
}

/// Sink that logs a summary of every batch
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCostSink;

#[async_trait]
impl CostSink for LoggingCostSink {
    async fn flush(&self, batch: Vec<CostEvent>) -> Result<(), PortError> {
        let mut units: BTreeMap<CostKind, u64> = BTreeMap::new();
        for event in &batch {
            *units.entry(event.kind).or_default() += u64::from(event.units);
        }
        tracing::info!(events = batch.len(), ?units, "cost batch");
        Ok(())
    }
}

/// Batching limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
        }
    }
}

impl CostConfig {
    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// With flush interval
    #[inline]
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Batching cost recorder
///
/// `record` never blocks; events recorded after shutdown are dropped with a
/// warning.
pub struct CostMeter {
    tx: Mutex<Option<mpsc::UnboundedSender<CostEvent>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CostMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostMeter").finish_non_exhaustive()
    }
}

impl CostMeter {
    /// Start the batching task
    #[must_use]
    pub fn spawn(sink: Arc<dyn CostSink>, config: CostConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run_batches(rx, sink, config));
        Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }
    }

    /// Flush what is queued and stop the batching task
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "cost meter task failed");
            }
        }
    }
}

impl CostRecorder for CostMeter {
    fn record(&self, event: CostEvent) {
        let sent = self
            .tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok());
        if !sent {
            tracing::warn!("cost meter stopped; event dropped");
        }
    }
}

async fn run_batches(
    mut rx: mpsc::UnboundedReceiver<CostEvent>,
    sink: Arc<dyn CostSink>,
    config: CostConfig,
) {
    let batch_size = config.batch_size.max(1);
    let mut ticker = tokio::time::interval(config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut batch = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        deliver(sink.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => deliver(sink.as_ref(), &mut batch).await,
        }
    }
    deliver(sink.as_ref(), &mut batch).await;
}

async fn deliver(sink: &dyn CostSink, batch: &mut Vec<CostEvent>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    match sink.flush(events).await {
        Ok(()) => {
            metrics::counter!("custos_cost_events_total").increment(count as u64);
            tracing::debug!(count, "cost batch flushed");
        }
        Err(err) => {
            metrics::counter!("custos_cost_flush_failures_total").increment(1);
            tracing::warn!(count, error = %err, "cost batch lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_core::AgentKind;

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<Vec<CostEvent>>>,
    }

    #[async_trait]
    impl CostSink for Collect {
        async fn flush(&self, batch: Vec<CostEvent>) -> Result<(), PortError> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn submission(key: &str) -> CostEvent {
        CostEvent::new(CostKind::LedgerSubmission, AgentKind::Paolo, key)
    }

    #[tokio::test(start_paused = true)]
    async fn full_batches_flush_immediately() {
        let sink = Arc::new(Collect::default());
        let meter = CostMeter::spawn(sink.clone(), CostConfig::default().with_batch_size(2));
        meter.record(submission("a"));
        meter.record(submission("b"));
        meter.record(submission("c"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(sink.batches.lock().len(), 1);
        meter.shutdown().await;
        let sizes: Vec<usize> = sink.batches.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_on_interval() {
        let sink = Arc::new(Collect::default());
        let meter = CostMeter::spawn(
            sink.clone(),
            CostConfig::default().with_flush_interval(Duration::from_secs(5)),
        );
        meter.record(submission("a"));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(sink.batches.lock().len(), 1);
        meter.shutdown().await;
        meter.record(submission("late"));
        assert_eq!(sink.batches.lock().len(), 1);
    }
}
