//! Session audit trail
//!
//! Append-only record of every level transition, risk denial, fill, and
//! halt. Live sessions persist to SQLite (WAL) with a JSON export for
//! inspection; backtests and tests use the in-memory sink.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::planner::LevelStatus;
use crate::types::Money;

/// One audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    LevelTransition {
        level_index: usize,
        from: LevelStatus,
        to: LevelStatus,
    },
    OrderDenied {
        client_id: u64,
        reason: String,
    },
    Fill {
        exchange_order_id: String,
        fill_id: String,
        price: Money,
        quantity: Money,
    },
    Halt {
        reason: String,
    },
}

/// Append-only audit sink
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// In-memory sink for tests and backtests
#[derive(Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn denials(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, AuditEvent::OrderDenied { .. }))
            .count()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// SQLite-backed audit trail with JSON export
pub struct SqliteAudit {
    conn: Mutex<Connection>,
    json_export_path: PathBuf,
}

impl SqliteAudit {
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir)?;

        let db_path = state_dir.join("audit.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open audit database: {}", db_path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        debug!("Audit database ready at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            json_export_path: state_dir.join("audit.json"),
        })
    }

    /// Dump the full trail as a JSON array next to the database.
    pub fn export_json(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT recorded_at, payload FROM events ORDER BY id")?;
        let rows: Vec<serde_json::Value> = stmt
            .query_map([], |row| {
                let recorded_at: String = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((recorded_at, payload))
            })?
            .filter_map(|r| r.ok())
            .map(|(recorded_at, payload)| {
                let mut value: serde_json::Value =
                    serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("recorded_at".to_string(), serde_json::json!(recorded_at));
                }
                value
            })
            .collect();

        std::fs::write(
            &self.json_export_path,
            serde_json::to_string_pretty(&rows)?,
        )?;
        debug!("Audit trail exported to {}", self.json_export_path.display());
        Ok(())
    }
}

impl AuditSink for SqliteAudit {
    fn record(&self, event: &AuditEvent) {
        let kind = match event {
            AuditEvent::LevelTransition { .. } => "level_transition",
            AuditEvent::OrderDenied { .. } => "order_denied",
            AuditEvent::Fill { .. } => "fill",
            AuditEvent::Halt { .. } => "halt",
        };
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO events (recorded_at, kind, payload) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), kind, payload],
        ) {
            tracing::error!("Failed to record audit event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_audit_records_in_order() {
        let audit = MemoryAudit::new();
        audit.record(&AuditEvent::LevelTransition {
            level_index: 0,
            from: LevelStatus::Pending,
            to: LevelStatus::Open,
        });
        audit.record(&AuditEvent::OrderDenied {
            client_id: 7,
            reason: "rate_limited".to_string(),
        });

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AuditEvent::LevelTransition { .. }));
        assert_eq!(audit.denials(), 1);
    }

    #[test]
    fn test_audit_event_serde() {
        let event = AuditEvent::Fill {
            exchange_order_id: "ex-1".to_string(),
            fill_id: "f-1".to_string(),
            price: Money::from_f64(95.0),
            quantity: Money::from_f64(2.0),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"fill\""));
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, AuditEvent::Fill { .. }));
    }
}
