//! SQLite-backed veto repository
//!
//! Tables `veto_sessions` and `decision_audit`. Timestamps are RFC 3339 with
//! nanoseconds, amounts are integer cents, the timeout is derived from
//! `expires_at - opened_at` on read.

use crate::audit::{AuditEventType, DecisionAudit};
use crate::error::{Result, VetoError};
use crate::repository::VetoRepository;
use crate::session::{VetoSession, VetoStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use custos_core::{CarrierId, LedgerHash, Money, SessionId, ShipmentId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, agent_type, operation_type, shipment_ref, counterparty_ref, \
     amount, confidence, status, timeout_seconds, opened_at, expires_at, committed_at, vetoed_at, \
     operator_id, rationale, ledger_tx_hash, compensation_tx_hash, compensation_pending, context_json";

/// Veto repository on a SQLite connection
pub struct SqliteVetoRepository {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteVetoRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVetoRepository").finish_non_exhaustive()
    }
}

impl SqliteVetoRepository {
    /// Create repository on an in-memory database
    ///
    /// # Errors
    /// Returns `VetoError::Repository` if the schema cannot be created
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Create repository on a file-backed database
    ///
    /// # Errors
    /// Returns `VetoError::Repository` if the file cannot be opened
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS veto_sessions (
                id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                shipment_ref TEXT,
                counterparty_ref TEXT,
                amount INTEGER NOT NULL,
                confidence REAL,
                status TEXT NOT NULL,
                timeout_seconds REAL NOT NULL,
                opened_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                committed_at TEXT,
                vetoed_at TEXT,
                operator_id TEXT,
                rationale TEXT,
                ledger_tx_hash TEXT,
                compensation_tx_hash TEXT,
                compensation_pending INTEGER NOT NULL DEFAULT 0,
                context_json TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS decision_audit (
                id TEXT PRIMARY KEY,
                veto_session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                operator_id TEXT NOT NULL,
                operator_action TEXT,
                rationale TEXT,
                time_to_decision_ms INTEGER,
                final_state TEXT NOT NULL,
                ledger_tx_hash TEXT,
                seq INTEGER NOT NULL,
                FOREIGN KEY (veto_session_id) REFERENCES veto_sessions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_veto_sessions_status ON veto_sessions(status);
            CREATE INDEX IF NOT EXISTS idx_decision_audit_session ON decision_audit(veto_session_id);
            ",
        )?;
        Ok(())
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VetoError::Repository(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn bad_column(name: &str, err: impl std::fmt::Display) -> VetoError {
    VetoError::Repository(format!("bad {name} column: {err}"))
}

/// Raw column values; converted outside the rusqlite row callback
struct SessionRow {
    id: String,
    agent: String,
    operation: String,
    shipment_ref: Option<String>,
    counterparty_ref: Option<String>,
    amount: i64,
    confidence: Option<f64>,
    status: String,
    opened_at: String,
    expires_at: String,
    committed_at: Option<String>,
    vetoed_at: Option<String>,
    operator_id: Option<String>,
    rationale: Option<String>,
    ledger_tx_hash: Option<String>,
    compensation_tx_hash: Option<String>,
    compensation_pending: bool,
    context_json: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent: row.get(1)?,
            operation: row.get(2)?,
            shipment_ref: row.get(3)?,
            counterparty_ref: row.get(4)?,
            amount: row.get(5)?,
            confidence: row.get(6)?,
            status: row.get(7)?,
            opened_at: row.get(9)?,
            expires_at: row.get(10)?,
            committed_at: row.get(11)?,
            vetoed_at: row.get(12)?,
            operator_id: row.get(13)?,
            rationale: row.get(14)?,
            ledger_tx_hash: row.get(15)?,
            compensation_tx_hash: row.get(16)?,
            compensation_pending: row.get(17)?,
            context_json: row.get(18)?,
        })
    }

    fn into_session(self) -> Result<VetoSession> {
        let opened_at = parse_ts(&self.opened_at)?;
        let expires_at = parse_ts(&self.expires_at)?;
        let timeout = (expires_at - opened_at)
            .to_std()
            .map_err(|e| bad_column("expires_at", e))?;
        Ok(VetoSession {
            id: self.id.parse().map_err(|e| bad_column("id", e))?,
            agent: self.agent.parse().map_err(|e| bad_column("agent_type", e))?,
            operation: self
                .operation
                .parse()
                .map_err(|e| bad_column("operation_type", e))?,
            shipment_ref: self.shipment_ref.map(ShipmentId::from),
            counterparty_ref: self.counterparty_ref.map(CarrierId::from),
            amount: Money::from_cents(self.amount),
            confidence: self.confidence,
            status: self.status.parse()?,
            timeout,
            opened_at,
            expires_at,
            committed_at: parse_opt_ts(self.committed_at)?,
            vetoed_at: parse_opt_ts(self.vetoed_at)?,
            operator_id: self.operator_id,
            rationale: self.rationale,
            ledger_tx_hash: self.ledger_tx_hash.map(LedgerHash::from),
            compensation_tx_hash: self.compensation_tx_hash.map(LedgerHash::from),
            compensation_pending: self.compensation_pending,
            context: serde_json::from_str(&self.context_json)
                .map_err(|e| bad_column("context_json", e))?,
        })
    }
}

struct AuditRow {
    id: String,
    session_id: String,
    timestamp: String,
    event: String,
    actor: String,
    operator_action: Option<String>,
    rationale: Option<String>,
    time_to_decision_ms: Option<i64>,
    final_state: String,
    ledger_tx_hash: Option<String>,
}

impl AuditRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            timestamp: row.get(2)?,
            event: row.get(3)?,
            actor: row.get(4)?,
            operator_action: row.get(5)?,
            rationale: row.get(6)?,
            time_to_decision_ms: row.get(7)?,
            final_state: row.get(8)?,
            ledger_tx_hash: row.get(9)?,
        })
    }

    fn into_audit(self) -> Result<DecisionAudit> {
        Ok(DecisionAudit {
            id: Uuid::parse_str(&self.id).map_err(|e| bad_column("id", e))?,
            session_id: self
                .session_id
                .parse::<SessionId>()
                .map_err(|e| bad_column("veto_session_id", e))?,
            timestamp: parse_ts(&self.timestamp)?,
            event: self.event.parse::<AuditEventType>()?,
            actor: self.actor,
            operator_action: self.operator_action,
            rationale: self.rationale,
            time_to_decision_ms: self.time_to_decision_ms,
            final_state: self.final_state.parse()?,
            ledger_tx_hash: self.ledger_tx_hash.map(LedgerHash::from),
        })
    }
}

fn write_params(session: &VetoSession) -> Result<(String, String)> {
    let context = serde_json::to_string(&session.context).map_err(|e| bad_column("context_json", e))?;
    Ok((session.id.to_string(), context))
}

#[async_trait]
impl VetoRepository for SqliteVetoRepository {
    async fn insert_session(&self, session: &VetoSession) -> Result<()> {
        let (id, context) = write_params(session)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO veto_sessions ({SESSION_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                id,
                session.agent.as_str(),
                session.operation.as_str(),
                session.shipment_ref.as_ref().map(ShipmentId::as_str),
                session.counterparty_ref.as_ref().map(CarrierId::as_str),
                session.amount.cents(),
                session.confidence,
                session.status.as_str(),
                session.timeout.as_secs_f64(),
                ts(session.opened_at),
                ts(session.expires_at),
                session.committed_at.map(ts),
                session.vetoed_at.map(ts),
                session.operator_id,
                session.rationale,
                session.ledger_tx_hash.as_ref().map(LedgerHash::as_str),
                session.compensation_tx_hash.as_ref().map(LedgerHash::as_str),
                session.compensation_pending,
                context,
            ],
        )?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<VetoSession>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM veto_sessions WHERE id = ?1"),
                params![id.to_string()],
                SessionRow::from_row,
            )
            .optional()?
        };
        row.map(SessionRow::into_session).transpose()
    }

    async fn update_session(&self, session: &VetoSession, expected: VetoStatus) -> Result<()> {
        let (id, context) = write_params(session)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE veto_sessions SET status = ?2, committed_at = ?3, vetoed_at = ?4, \
             operator_id = ?5, rationale = ?6, ledger_tx_hash = ?7, compensation_tx_hash = ?8, \
             compensation_pending = ?9, context_json = ?10 \
             WHERE id = ?1 AND status = ?11",
            params![
                id,
                session.status.as_str(),
                session.committed_at.map(ts),
                session.vetoed_at.map(ts),
                session.operator_id,
                session.rationale,
                session.ledger_tx_hash.as_ref().map(LedgerHash::as_str),
                session.compensation_tx_hash.as_ref().map(LedgerHash::as_str),
                session.compensation_pending,
                context,
                expected.as_str(),
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let actual: Option<String> = conn
            .query_row(
                "SELECT status FROM veto_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match actual {
            None => Err(VetoError::SessionNotFound(session.id)),
            Some(actual) => Err(VetoError::Conflict {
                id: session.id,
                expected,
                actual: actual.parse()?,
            }),
        }
    }

    async fn list_by_status(&self, status: VetoStatus) -> Result<Vec<VetoSession>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM veto_sessions WHERE status = ?1 ORDER BY opened_at"
            ))?;
            let rows = stmt
                .query_map(params![status.as_str()], SessionRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn append_audit(&self, entry: &DecisionAudit) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO decision_audit (id, veto_session_id, timestamp, event_type, operator_id, \
             operator_action, rationale, time_to_decision_ms, final_state, ledger_tx_hash, seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
             (SELECT COALESCE(MAX(seq), 0) + 1 FROM decision_audit))",
            params![
                entry.id.to_string(),
                entry.session_id.to_string(),
                ts(entry.timestamp),
                entry.event.as_str(),
                entry.actor,
                entry.operator_action,
                entry.rationale,
                entry.time_to_decision_ms,
                entry.final_state.as_str(),
                entry.ledger_tx_hash.as_ref().map(LedgerHash::as_str),
            ],
        )?;
        Ok(())
    }

    async fn audit_for(&self, id: SessionId) -> Result<Vec<DecisionAudit>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, veto_session_id, timestamp, event_type, operator_id, operator_action, \
                 rationale, time_to_decision_ms, final_state, ledger_tx_hash \
                 FROM decision_audit WHERE veto_session_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![id.to_string()], AuditRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(AuditRow::into_audit).collect()
    }
}
