//! Durable, append-only audit trail backed by SQLite.
//!
//! Grounded on the WAL-mode/busy-timeout/indexed-schema idiom used by the
//! teacher's memory store: open once, set pragmas for crash-durability and
//! concurrent writers, create indices up front, never mutate a row after
//! insert.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aegis_types::{AuditEntry, AuditEventKind, OrchestratorError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub client_id: Option<String>,
    pub event_type: Option<AuditEventKind>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Append-only record store with indices on timestamp, client id, event
/// type, and correlation id.
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
    retention_days: i64,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>, retention_days: i64) -> Result<Self, OrchestratorError> {
        let conn = Connection::open(path).map_err(|e| OrchestratorError::Audit {
            detail: e.to_string(),
        })?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention_days,
        })
    }

    pub fn open_in_memory(retention_days: i64) -> Result<Self, OrchestratorError> {
        let conn = Connection::open_in_memory().map_err(|e| OrchestratorError::Audit {
            detail: e.to_string(),
        })?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention_days,
        })
    }

    fn init(conn: &Connection) -> Result<(), OrchestratorError> {
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(to_audit_error)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS audit_entries (
                 id TEXT PRIMARY KEY,
                 timestamp TEXT NOT NULL,
                 client_id TEXT NOT NULL,
                 user_id TEXT,
                 event_type TEXT NOT NULL,
                 correlation_id TEXT,
                 payload TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_entries(timestamp);
             CREATE INDEX IF NOT EXISTS idx_audit_client ON audit_entries(client_id);
             CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_entries(event_type);
             CREATE INDEX IF NOT EXISTS idx_audit_correlation ON audit_entries(correlation_id);",
        )
        .map_err(to_audit_error)?;
        Ok(())
    }

    /// Appends a new entry, assigning a fresh id and the current clock
    /// timestamp. Never fails silently.
    pub async fn log(
        &self,
        client_id: &str,
        event_type: AuditEventKind,
        payload: Value,
        correlation_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<AuditEntry, OrchestratorError> {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            user_id,
            event_type,
            payload,
            correlation_id,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_entries (id, timestamp, client_id, user_id, event_type, correlation_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.timestamp.to_rfc3339(),
                entry.client_id,
                entry.user_id,
                entry.event_type.as_str(),
                entry.correlation_id,
                serde_json::to_string(&entry.payload).map_err(|e| OrchestratorError::Audit {
                    detail: e.to_string(),
                })?,
            ],
        )
        .map_err(to_audit_error)?;
        Ok(entry)
    }

    /// Returns matching entries in descending timestamp order.
    pub async fn query(&self, criteria: &AuditQuery) -> Result<Vec<AuditEntry>, OrchestratorError> {
        let (sql, binds) = build_filtered_query(
            "SELECT id, timestamp, client_id, user_id, event_type, correlation_id, payload FROM audit_entries",
            criteria,
        );
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql).map_err(to_audit_error)?;
        let bind_refs: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b.as_ref() as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(bind_refs.as_slice(), row_to_entry)
            .map_err(to_audit_error)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(to_audit_error)?);
        }
        Ok(entries)
    }

    pub async fn count(&self, criteria: &AuditQuery) -> Result<u64, OrchestratorError> {
        let mut unlimited = criteria.clone();
        unlimited.limit = None;
        let (sql, binds) =
            build_filtered_query("SELECT COUNT(*) FROM audit_entries", &unlimited);
        let conn = self.conn.lock().await;
        let bind_refs: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b.as_ref() as &dyn rusqlite::ToSql).collect();
        let count: i64 = conn
            .query_row(&sql, bind_refs.as_slice(), |row| row.get(0))
            .map_err(to_audit_error)?;
        Ok(count as u64)
    }

    /// Deletes entries older than the retention horizon. Returns the number
    /// deleted.
    pub async fn cleanup(&self) -> Result<u64, OrchestratorError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM audit_entries WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(to_audit_error)?;
        if deleted > 0 {
            tracing::info!(deleted, retention_days = self.retention_days, "audit log retention sweep");
        }
        Ok(deleted as u64)
    }
}

fn to_audit_error(e: rusqlite::Error) -> OrchestratorError {
    OrchestratorError::Audit {
        detail: e.to_string(),
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let timestamp_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(4)?;
    let payload_raw: String = row.get(6)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        client_id: row.get(2)?,
        user_id: row.get(3)?,
        event_type: AuditEventKind::from_str_opt(&event_type_raw)
            .unwrap_or(AuditEventKind::QueryReceived),
        correlation_id: row.get(5)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
    })
}

fn build_filtered_query(
    base: &str,
    criteria: &AuditQuery,
) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = Vec::new();
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(client_id) = &criteria.client_id {
        clauses.push(format!("client_id = ?{}", binds.len() + 1));
        binds.push(Box::new(client_id.clone()));
    }
    if let Some(event_type) = criteria.event_type {
        clauses.push(format!("event_type = ?{}", binds.len() + 1));
        binds.push(Box::new(event_type.as_str().to_string()));
    }
    if let Some(correlation_id) = &criteria.correlation_id {
        clauses.push(format!("correlation_id = ?{}", binds.len() + 1));
        binds.push(Box::new(correlation_id.clone()));
    }
    if let Some(since) = criteria.since {
        clauses.push(format!("timestamp >= ?{}", binds.len() + 1));
        binds.push(Box::new(since.to_rfc3339()));
    }
    if let Some(until) = criteria.until {
        clauses.push(format!("timestamp <= ?{}", binds.len() + 1));
        binds.push(Box::new(until.to_rfc3339()));
    }

    let mut sql = base.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if base.starts_with("SELECT id") {
        sql.push_str(" ORDER BY timestamp DESC");
        if let Some(limit) = criteria.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
    }
    (sql, binds)
}
