//! Saga rollback and idempotency

use async_trait::async_trait;
use custos_agents::{
    Agent, AgentContext, FailoverAgent, InMemoryShipmentStore, Outcome, SagaExecutor,
    ShipmentStore,
};
use custos_core::{LedgerClient, LedgerHash, LedgerPayload, NullSink, PortError};
use custos_test_utils::{add_shipment, seeded_store, FakeLedger};
use mockall::mock;
use pretty_assertions::assert_eq;
use std::sync::Arc;

mock! {
    pub Ledger {}

    #[async_trait]
    impl LedgerClient for Ledger {
        async fn submit(&self, payload: LedgerPayload) -> Result<LedgerHash, PortError>;
    }
}

fn paolo(store: Arc<InMemoryShipmentStore>, ledger: Arc<dyn LedgerClient>) -> FailoverAgent {
    FailoverAgent::new(
        Arc::new(SagaExecutor::new(store, ledger)),
        Arc::new(NullSink),
    )
}

#[tokio::test]
async fn ledger_failure_restores_the_record_byte_for_byte() {
    let store = seeded_store().await;
    add_shipment(store.as_ref(), "SHP-1", "BRT", 7_500).await;
    let before = serde_json::to_vec(&store.get_shipment(&"SHP-1".into()).await.unwrap().unwrap()).unwrap();

    let ledger = Arc::new(FakeLedger::failing());
    let agent = paolo(store.clone(), ledger.clone());
    let proposal = agent
        .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
        .await
        .unwrap();
    let outcome = agent.execute(&proposal).await.unwrap();

    assert!(!outcome.success());
    let compensation = outcome.compensation().unwrap();
    assert!(compensation.success);
    assert!(compensation.action.contains("SHP-1"));
    assert!(outcome.error().unwrap().contains("simulated outage"));

    let after = serde_json::to_vec(&store.get_shipment(&"SHP-1".into()).await.unwrap().unwrap()).unwrap();
    assert_eq!(before, after);

    let changes = store.carrier_changes_for(&"SHP-1".into()).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert!(!changes[0].success);
    assert_eq!(changes[0].new_counterparty, None);
    assert_eq!(ledger.submission_count(), 1);
}

#[tokio::test]
async fn repeat_execution_is_idempotent() {
    let store = seeded_store().await;
    add_shipment(store.as_ref(), "SHP-1", "BRT", 7_500).await;

    let mut ledger = MockLedger::new();
    ledger
        .expect_submit()
        .times(1)
        .returning(|payload| Ok(LedgerHash::new(payload.digest())));
    let agent = paolo(store.clone(), Arc::new(ledger));

    let proposal = agent
        .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
        .await
        .unwrap();
    let first = agent.execute(&proposal).await.unwrap();
    let second = agent.execute(&proposal).await.unwrap();

    assert!(first.success() && !first.idempotent());
    assert!(second.success() && second.idempotent());
    assert_eq!(first.ledger_hash(), second.ledger_hash());

    let Outcome::Failover(result) = second else {
        panic!("expected failover outcome");
    };
    assert_eq!(result.to.as_str(), "SDA");
    assert_eq!(store.change_count(), 1);
}

#[tokio::test]
async fn retry_after_rollback_submits_again() {
    let store = seeded_store().await;
    add_shipment(store.as_ref(), "SHP-1", "BRT", 7_500).await;
    let ledger = Arc::new(FakeLedger::failing());
    let agent = paolo(store.clone(), ledger.clone());
    let proposal = agent
        .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
        .await
        .unwrap();

    assert!(!agent.execute(&proposal).await.unwrap().success());
    ledger.set_failing(false);
    let retried = agent.execute(&proposal).await.unwrap();

    assert!(retried.success());
    assert!(!retried.idempotent());
    assert_eq!(ledger.submission_count(), 2);
    let shipment = store.get_shipment(&"SHP-1".into()).await.unwrap().unwrap();
    assert_eq!(shipment.carrier.as_str(), "SDA");
    assert_eq!(shipment.ledger_tx_hash.as_ref(), retried.ledger_hash());
}
