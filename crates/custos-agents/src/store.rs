//! Business-record store port
//!
//! Shipments, carriers and disputes live outside the governance tables. The
//! agents read them, write them inside a saga, and restore them from a
//! pre-image when the ledger step fails. Shipments and disputes carry a
//! `version` that every saga write checks.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custos_core::{CarrierId, DisputeId, LedgerHash, Money, ShipmentId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shipment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    InTransit,
    Delayed,
    Exception,
    Delivered,
    Cancelled,
}

impl ShipmentStatus {
    /// Shipment can still be moved to another carrier
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::InTransit | Self::Delayed | Self::Exception)
    }
}

/// One shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub id: ShipmentId,
    pub carrier: CarrierId,
    /// Declared goods value; the amount governed on failover
    pub value: Money,
    pub status: ShipmentStatus,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    /// Ledger transaction of the last committed change
    pub ledger_tx_hash: Option<LedgerHash>,
}

impl ShipmentRecord {
    /// Create new in-transit shipment at version 1
    #[must_use]
    pub fn new(id: impl Into<ShipmentId>, carrier: impl Into<CarrierId>, value: Money) -> Self {
        Self {
            id: id.into(),
            carrier: carrier.into(),
            value,
            status: ShipmentStatus::InTransit,
            version: 1,
            updated_at: Utc::now(),
            ledger_tx_hash: None,
        }
    }

    /// With status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: ShipmentStatus) -> Self {
        self.status = status;
        self
    }

    /// With last-update timestamp
    #[inline]
    #[must_use]
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }
}

/// One carrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierRecord {
    pub id: CarrierId,
    pub name: String,
    /// Rolling on-time reliability in `0.0..=1.0`
    pub reliability: f64,
    /// Inactive carriers receive no new shipments
    pub active: bool,
}

impl CarrierRecord {
    /// Create new active carrier
    #[must_use]
    pub fn new(id: impl Into<CarrierId>, name: impl Into<String>, reliability: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            reliability: reliability.clamp(0.0, 1.0),
            active: true,
        }
    }
}

/// Dispute lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// Final ruling recorded on a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ruling {
    ForInitiator,
    ForRespondent,
}

/// One dispute between a shipper and a carrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub id: DisputeId,
    pub shipment: ShipmentId,
    /// Party that opened the dispute
    pub initiator: String,
    /// Carrier the claim is against
    pub respondent: CarrierId,
    pub claimed_amount: Money,
    /// The respondent claims proof of delivery
    pub delivery_verified: bool,
    pub status: DisputeStatus,
    pub ruling: Option<Ruling>,
    pub ledger_tx_hash: Option<LedgerHash>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl DisputeRecord {
    /// Create new open dispute at version 1
    #[must_use]
    pub fn new(
        id: impl Into<DisputeId>,
        shipment: impl Into<ShipmentId>,
        initiator: impl Into<String>,
        respondent: impl Into<CarrierId>,
        claimed_amount: Money,
    ) -> Self {
        Self {
            id: id.into(),
            shipment: shipment.into(),
            initiator: initiator.into(),
            respondent: respondent.into(),
            claimed_amount,
            delivery_verified: false,
            status: DisputeStatus::Open,
            ruling: None,
            ledger_tx_hash: None,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    /// With delivery-verified flag
    #[inline]
    #[must_use]
    pub fn with_delivery_verified(mut self, verified: bool) -> Self {
        self.delivery_verified = verified;
        self
    }
}

/// Durable trace of one failover attempt, written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierChange {
    pub id: Uuid,
    pub business_key: String,
    pub shipment_ref: ShipmentId,
    pub old_counterparty: CarrierId,
    pub new_counterparty: Option<CarrierId>,
    pub reason: String,
    /// `ai:<agent>` or an operator id
    pub executed_by: String,
    pub ledger_tx_hash: Option<LedgerHash>,
    pub success: bool,
    /// Reference of the rollback when the saga was compensated
    pub rollback_tx_hash: Option<LedgerHash>,
    pub created_at: DateTime<Utc>,
}

/// Storage for shipments, carriers, disputes and carrier changes
#[async_trait]
pub trait ShipmentStore: Send + Sync {
    async fn get_shipment(&self, id: &ShipmentId) -> Result<Option<ShipmentRecord>, StoreError>;

    /// Insert or overwrite a shipment unconditionally
    async fn put_shipment(&self, record: ShipmentRecord) -> Result<(), StoreError>;

    /// Replace a shipment if its stored version is still `expected_version`
    async fn update_shipment(
        &self,
        record: ShipmentRecord,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Active shipments carried by `carrier`, ordered by id
    async fn active_shipments_for(
        &self,
        carrier: &CarrierId,
    ) -> Result<Vec<ShipmentRecord>, StoreError>;

    async fn get_carrier(&self, id: &CarrierId) -> Result<Option<CarrierRecord>, StoreError>;

    /// Carriers ordered by id
    async fn list_carriers(&self) -> Result<Vec<CarrierRecord>, StoreError>;

    async fn put_carrier(&self, record: CarrierRecord) -> Result<(), StoreError>;

    /// Flag a carrier active or inactive
    async fn set_carrier_active(&self, id: &CarrierId, active: bool) -> Result<(), StoreError>;

    async fn get_dispute(&self, id: &DisputeId) -> Result<Option<DisputeRecord>, StoreError>;

    /// Insert or overwrite a dispute unconditionally
    async fn put_dispute(&self, record: DisputeRecord) -> Result<(), StoreError>;

    /// Replace a dispute if its stored version is still `expected_version`
    async fn update_dispute(
        &self,
        record: DisputeRecord,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Append a carrier change
    async fn insert_carrier_change(&self, change: CarrierChange) -> Result<(), StoreError>;

    /// Carrier changes for a shipment, oldest first
    async fn carrier_changes_for(
        &self,
        shipment: &ShipmentId,
    ) -> Result<Vec<CarrierChange>, StoreError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryShipmentStore {
    shipments: DashMap<ShipmentId, ShipmentRecord>,
    carriers: DashMap<CarrierId, CarrierRecord>,
    disputes: DashMap<DisputeId, DisputeRecord>,
    changes: Mutex<Vec<CarrierChange>>,
}

impl InMemoryShipmentStore {
    /// Create new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded carrier changes
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes.lock().len()
    }
}

#[async_trait]
impl ShipmentStore for InMemoryShipmentStore {
    async fn get_shipment(&self, id: &ShipmentId) -> Result<Option<ShipmentRecord>, StoreError> {
        Ok(self.shipments.get(id).map(|entry| entry.value().clone()))
    }

    async fn put_shipment(&self, record: ShipmentRecord) -> Result<(), StoreError> {
        self.shipments.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_shipment(
        &self,
        record: ShipmentRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .shipments
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::not_found("shipment", &record.id))?;
        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                kind: "shipment",
                id: record.id.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }
        *entry = record;
        Ok(())
    }

    async fn active_shipments_for(
        &self,
        carrier: &CarrierId,
    ) -> Result<Vec<ShipmentRecord>, StoreError> {
        let mut shipments: Vec<ShipmentRecord> = self
            .shipments
            .iter()
            .filter(|entry| &entry.carrier == carrier && entry.status.is_active())
            .map(|entry| entry.value().clone())
            .collect();
        shipments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(shipments)
    }

    async fn get_carrier(&self, id: &CarrierId) -> Result<Option<CarrierRecord>, StoreError> {
        Ok(self.carriers.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_carriers(&self) -> Result<Vec<CarrierRecord>, StoreError> {
        let mut carriers: Vec<CarrierRecord> =
            self.carriers.iter().map(|entry| entry.value().clone()).collect();
        carriers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(carriers)
    }

    async fn put_carrier(&self, record: CarrierRecord) -> Result<(), StoreError> {
        self.carriers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_carrier_active(&self, id: &CarrierId, active: bool) -> Result<(), StoreError> {
        let mut entry = self
            .carriers
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("carrier", id))?;
        entry.active = active;
        Ok(())
    }

    async fn get_dispute(&self, id: &DisputeId) -> Result<Option<DisputeRecord>, StoreError> {
        Ok(self.disputes.get(id).map(|entry| entry.value().clone()))
    }

    async fn put_dispute(&self, record: DisputeRecord) -> Result<(), StoreError> {
        self.disputes.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_dispute(
        &self,
        record: DisputeRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .disputes
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::not_found("dispute", &record.id))?;
        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                kind: "dispute",
                id: record.id.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }
        *entry = record;
        Ok(())
    }

    async fn insert_carrier_change(&self, change: CarrierChange) -> Result<(), StoreError> {
        self.changes.lock().push(change);
        Ok(())
    }

    async fn carrier_changes_for(
        &self,
        shipment: &ShipmentId,
    ) -> Result<Vec<CarrierChange>, StoreError> {
        Ok(self
            .changes
            .lock()
            .iter()
            .filter(|change| &change.shipment_ref == shipment)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_checks_version() {
        let store = InMemoryShipmentStore::new();
        let shipment = ShipmentRecord::new("SHP-1", "BRT", Money::from_euros(7_500));
        store.put_shipment(shipment.clone()).await.unwrap();

        let mut moved = shipment.clone();
        moved.carrier = CarrierId::new("GLS");
        moved.version = 2;
        store.update_shipment(moved.clone(), 1).await.unwrap();

        let err = store.update_shipment(moved, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn active_shipments_exclude_delivered() {
        let store = InMemoryShipmentStore::new();
        for (id, status) in [
            ("SHP-3", ShipmentStatus::Delayed),
            ("SHP-1", ShipmentStatus::InTransit),
            ("SHP-2", ShipmentStatus::Delivered),
        ] {
            store
                .put_shipment(
                    ShipmentRecord::new(id, "BRT", Money::from_euros(100)).with_status(status),
                )
                .await
                .unwrap();
        }
        store
            .put_shipment(ShipmentRecord::new("SHP-4", "GLS", Money::from_euros(100)))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .active_shipments_for(&CarrierId::new("BRT"))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["SHP-1", "SHP-3"]);
    }

    #[tokio::test]
    async fn deactivating_unknown_carrier_fails() {
        let store = InMemoryShipmentStore::new();
        let err = store
            .set_carrier_active(&CarrierId::new("NOPE"), false)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::not_found("carrier", "NOPE"));
    }

    #[test]
    fn reliability_is_clamped() {
        assert!((CarrierRecord::new("X", "X", 1.7).reliability - 1.0).abs() < f64::EPSILON);
    }
}
