use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

use crate::record::AuditRecord;

pub const DEFAULT_MEMORY_CAP: usize = 100_000;

/// In-memory audit trail, bounded by record count. Oldest records fall
/// off first, mirroring the retention purge of the durable store.
#[derive(Debug)]
pub struct MemoryAuditStore {
    records: VecDeque<AuditRecord>,
    cap: usize,
}

impl MemoryAuditStore {
    pub fn new(cap: usize) -> Self {
        Self {
            records: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn append(&mut self, record: AuditRecord) {
        while self.records.len() >= self.cap {
            let _ = self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn by_detection(&self, detection_id: &str) -> Vec<AuditRecord> {
        self.records
            .iter()
            .filter(|r| r.detection_id == detection_id)
            .cloned()
            .collect()
    }

    fn by_rule(&self, rule_id: &str) -> Vec<AuditRecord> {
        self.records
            .iter()
            .filter(|r| r.rule_id.as_deref() == Some(rule_id))
            .cloned()
            .collect()
    }

    fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    fn purge_older_than(&mut self, cutoff_unix: i64, batch: usize) -> usize {
        let mut purged = 0;
        while purged < batch {
            match self.records.front() {
                Some(front) if front.created_at_unix < cutoff_unix => {
                    let _ = self.records.pop_front();
                    purged += 1;
                }
                _ => break,
            }
        }
        purged
    }

    fn count(&self) -> usize {
        self.records.len()
    }
}

/// Durable audit trail. A corrupt or unopenable database is fatal at
/// startup; at runtime append errors are surfaced to the caller, which
/// counts and alerts but keeps the pipeline alive.
#[derive(Debug)]
pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating audit dir {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed opening audit store {}", path))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS audit_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                audit_id TEXT NOT NULL,
                detection_id TEXT NOT NULL,
                decision_id TEXT NOT NULL,
                rule_id TEXT,
                created_at_unix INTEGER NOT NULL,
                payload_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_detection ON audit_records(detection_id);
            CREATE INDEX IF NOT EXISTS idx_audit_rule ON audit_records(rule_id);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_records(created_at_unix);
            ",
        )
        .context("failed initializing audit schema")?;

        info!(path = path, "audit store opened");
        Ok(Self { conn })
    }

    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("failed serializing audit record")?;
        self.conn
            .execute(
                "INSERT INTO audit_records(audit_id, detection_id, decision_id, rule_id, created_at_unix, payload_json)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.audit_id,
                    record.detection_id,
                    record.decision_id,
                    record.rule_id,
                    record.created_at_unix,
                    payload
                ],
            )
            .context("failed appending audit record")?;
        Ok(())
    }

    fn query(&self, where_clause: &str, value: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT payload_json FROM audit_records WHERE {} ORDER BY id DESC LIMIT {}",
            where_clause, limit
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let payload = row?;
            let record: AuditRecord = serde_json::from_str(&payload)
                .context("failed deserializing audit payload")?;
            records.push(record);
        }
        Ok(records)
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT payload_json FROM audit_records ORDER BY id DESC LIMIT {}",
            limit
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let payload = row?;
            records.push(serde_json::from_str(&payload).context("failed deserializing audit payload")?);
        }
        Ok(records)
    }

    fn purge_older_than(&mut self, cutoff_unix: i64, batch: usize) -> Result<usize> {
        let purged = self.conn.execute(
            "DELETE FROM audit_records WHERE id IN (
                SELECT id FROM audit_records WHERE created_at_unix < ?1 ORDER BY id ASC LIMIT ?2
            )",
            params![cutoff_unix, batch as i64],
        )?;
        Ok(purged)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

/// The audit sink the pipeline writes to: memory for tests and small
/// deployments, sqlite for anything that must survive a restart.
#[derive(Debug)]
pub enum AuditStore {
    Memory(MemoryAuditStore),
    Sqlite(SqliteAuditStore),
}

impl AuditStore {
    pub fn memory(cap: usize) -> Self {
        Self::Memory(MemoryAuditStore::new(cap))
    }

    pub fn sqlite(path: &str) -> Result<Self> {
        Ok(Self::Sqlite(SqliteAuditStore::open(path)?))
    }

    pub fn append(&mut self, record: AuditRecord) -> Result<()> {
        match self {
            Self::Memory(store) => {
                store.append(record);
                Ok(())
            }
            Self::Sqlite(store) => store.append(&record),
        }
    }

    pub fn by_detection(&self, detection_id: &str) -> Result<Vec<AuditRecord>> {
        match self {
            Self::Memory(store) => Ok(store.by_detection(detection_id)),
            Self::Sqlite(store) => store.query("detection_id = ?1", detection_id, 1_000),
        }
    }

    pub fn by_rule(&self, rule_id: &str) -> Result<Vec<AuditRecord>> {
        match self {
            Self::Memory(store) => Ok(store.by_rule(rule_id)),
            Self::Sqlite(store) => store.query("rule_id = ?1", rule_id, 1_000),
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        match self {
            Self::Memory(store) => Ok(store.recent(limit)),
            Self::Sqlite(store) => store.recent(limit),
        }
    }

    /// Batched retention purge; call until it returns zero.
    pub fn purge_older_than(&mut self, cutoff_unix: i64, batch: usize) -> Result<usize> {
        match self {
            Self::Memory(store) => Ok(store.purge_older_than(cutoff_unix, batch)),
            Self::Sqlite(store) => store.purge_older_than(cutoff_unix, batch),
        }
    }

    pub fn count(&self) -> Result<usize> {
        match self {
            Self::Memory(store) => Ok(store.count()),
            Self::Sqlite(store) => store.count(),
        }
    }
}
