//! libSQL storage layer for lead records and the routing log.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the record
//! queue (`records`) and the append-only audit trail (`routing_log`).
//!
//! **Contract with the orchestrator:**
//! - records: read-by-filter, update-by-id with merge semantics, status moves
//! - routing log: insert-only; update/delete are rejected by triggers
//! - read-only handles ([`Storage::open_readonly`]) reject every write

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadgarage_shared::{
    AgentStatus, LeadGarageError, Record, RecordId, RecordStatus, RecordType, Result,
    RoutingLogEntry,
};
use libsql::{Connection, Database, params};

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LeadGarageError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (reporting).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LeadGarageError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LeadGarageError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------------

    /// Insert a new record.
    pub async fn insert_record(&self, record: &Record) -> Result<()> {
        self.check_writable()?;
        let fields_json = serde_json::to_string(&record.fields)
            .map_err(|e| LeadGarageError::Storage(format!("encode fields: {e}")))?;
        let created = record.created_at.to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO records (record_id, record_type, fields_json, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.record_id.to_string(),
                    record.record_type.as_str(),
                    fields_json,
                    record.status.as_str(),
                    created.as_str(),
                    created.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a record by ID.
    pub async fn get_record(&self, record_id: &RecordId) -> Result<Option<Record>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, record_type, fields_json, status, created_at
                 FROM records WHERE record_id = ?1",
                params![record_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List up to `limit` records of `record_type` still in the invalid queue, oldest first.
    pub async fn list_invalid_records(
        &self,
        record_type: RecordType,
        limit: u32,
    ) -> Result<Vec<Record>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, record_type, fields_json, status, created_at
                 FROM records
                 WHERE record_type = ?1 AND status = ?2
                 ORDER BY created_at, record_id
                 LIMIT ?3",
                params![
                    record_type.as_str(),
                    RecordStatus::Invalid.as_str(),
                    i64::from(limit)
                ],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Merge `fields` into a record's field map. Existing keys not in `fields` are kept.
    pub async fn merge_fields(
        &self,
        record_id: &RecordId,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.check_writable()?;
        merge_fields_on(&self.conn, record_id, fields).await
    }

    /// Move a record to another lifecycle status.
    pub async fn set_record_status(&self, record_id: &RecordId, status: RecordStatus) -> Result<()> {
        self.check_writable()?;
        set_status_on(&self.conn, record_id, status).await
    }

    /// Log a successful repair and merge its fields in one transaction.
    ///
    /// With `promote` the record also moves to `valid`. Either every
    /// statement lands or none does.
    pub async fn apply_repair(&self, entry: &RoutingLogEntry, promote: bool) -> Result<()> {
        self.check_writable()?;
        // Own connection: statements other tasks issue on `conn` stay out of this transaction
        let conn = self.db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        let tx = conn.transaction().await.map_err(db_err)?;

        insert_entry_on(&tx, entry).await?;
        merge_fields_on(&tx, &entry.record_id, &entry.fields_repaired).await?;
        if promote {
            set_status_on(&tx, &entry.record_id, RecordStatus::Valid).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Count records per status. Returns `Vec<(status, count)>`.
    pub async fn count_records_by_status(&self) -> Result<Vec<(RecordStatus, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM records GROUP BY status ORDER BY status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            results.push((status.parse()?, count as u64));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Routing log operations (insert-only)
    // -----------------------------------------------------------------------

    /// Append a routing log entry.
    pub async fn insert_routing_entry(&self, entry: &RoutingLogEntry) -> Result<()> {
        self.check_writable()?;
        insert_entry_on(&self.conn, entry).await
    }

    /// All routing log entries for a record, in the order they were written.
    pub async fn list_routing_entries(&self, record_id: &RecordId) -> Result<Vec<RoutingLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT routing_id, record_id, record_type, garage_bay, capability_assigned,
                        routing_reason_json, repair_attempt_number, is_chronic_bad, disposition,
                        agent_status, failure_type, agent_started_at, agent_completed_at,
                        agent_cost, fields_repaired, confidence, hub_signal, denial_reason, routed_at
                 FROM routing_log WHERE record_id = ?1
                 ORDER BY routed_at, rowid",
                params![record_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_routing_entry(&row)?);
        }
        Ok(results)
    }

    /// Number of routing log entries for a record.
    pub async fn count_routing_entries(&self, record_id: &RecordId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM routing_log WHERE record_id = ?1",
                params![record_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Per-status entry counts and spend across the whole routing log.
    pub async fn routing_summary(&self) -> Result<RoutingSummary> {
        let mut rows = self
            .conn
            .query(
                "SELECT agent_status, COUNT(*), COALESCE(SUM(agent_cost), 0.0)
                 FROM routing_log GROUP BY agent_status ORDER BY agent_status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut summary = RoutingSummary::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            let cost: f64 = row.get(2).unwrap_or(0.0);
            summary.total_entries += count as u64;
            summary.total_cost += cost;
            summary.by_status.push((status.parse()?, count as u64, cost));
        }
        Ok(summary)
    }
}

/// Aggregate view of the routing log for reporting.
#[derive(Debug, Clone, Default)]
pub struct RoutingSummary {
    /// `(status, entries, cost)` per agent status.
    pub by_status: Vec<(AgentStatus, u64, f64)>,
    pub total_entries: u64,
    pub total_cost: f64,
}

// ---------------------------------------------------------------------------
// Statement helpers (shared by plain and transactional writes)
// ---------------------------------------------------------------------------

async fn merge_fields_on(
    conn: &Connection,
    record_id: &RecordId,
    fields: &BTreeMap<String, String>,
) -> Result<()> {
    let patch = serde_json::to_string(fields)
        .map_err(|e| LeadGarageError::Storage(format!("encode fields: {e}")))?;
    let now = Utc::now().to_rfc3339();
    let updated = conn
        .execute(
            "UPDATE records SET fields_json = json_patch(fields_json, ?1), updated_at = ?2
             WHERE record_id = ?3",
            params![patch, now.as_str(), record_id.to_string()],
        )
        .await
        .map_err(db_err)?;
    if updated == 0 {
        return Err(LeadGarageError::Storage(format!(
            "record {record_id} not found"
        )));
    }
    Ok(())
}

async fn set_status_on(conn: &Connection, record_id: &RecordId, status: RecordStatus) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE records SET status = ?1, updated_at = ?2 WHERE record_id = ?3",
        params![status.as_str(), now.as_str(), record_id.to_string()],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_entry_on(conn: &Connection, entry: &RoutingLogEntry) -> Result<()> {
    let reason_json = serde_json::to_string(&entry.routing_reason)
        .map_err(|e| LeadGarageError::Storage(format!("encode routing reason: {e}")))?;
    let fields_json = serde_json::to_string(&entry.fields_repaired)
        .map_err(|e| LeadGarageError::Storage(format!("encode repaired fields: {e}")))?;

    conn.execute(
        "INSERT INTO routing_log (
            routing_id, record_id, record_type, garage_bay, capability_assigned,
            routing_reason, routing_reason_json, repair_attempt_number, is_chronic_bad,
            disposition, agent_status, failure_type, agent_started_at, agent_completed_at,
            agent_cost, fields_repaired, confidence, hub_signal, denial_reason, routed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            entry.routing_id.as_str(),
            entry.record_id.to_string(),
            entry.record_type.as_str(),
            entry.garage_bay.map(|b| b.as_str()),
            entry.capability_assigned.map(|c| c.as_str()),
            entry.routing_reason.to_string(),
            reason_json,
            i64::from(entry.repair_attempt_number),
            i64::from(entry.is_chronic_bad),
            entry.disposition.as_str(),
            entry.agent_status.as_str(),
            entry.failure_type.map(|f| f.as_str()),
            entry.agent_started_at.map(|t| t.to_rfc3339()),
            entry.agent_completed_at.map(|t| t.to_rfc3339()),
            entry.agent_cost,
            fields_json,
            i64::from(entry.confidence),
            entry.hub_signal.map(|s| s.as_str()),
            entry.denial_reason.as_deref(),
            entry.routed_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

fn db_err(e: libsql::Error) -> LeadGarageError {
    LeadGarageError::Storage(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LeadGarageError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_record_id(s: &str) -> Result<RecordId> {
    s.parse()
        .map_err(|e| LeadGarageError::Storage(format!("invalid record id '{s}': {e}")))
}

/// Convert a database row to a [`Record`].
fn row_to_record(row: &libsql::Row) -> Result<Record> {
    let record_id: String = row.get(0).map_err(db_err)?;
    let record_type: String = row.get(1).map_err(db_err)?;
    let fields_json: String = row.get(2).map_err(db_err)?;
    let status: String = row.get(3).map_err(db_err)?;
    let created_at: String = row.get(4).map_err(db_err)?;

    Ok(Record {
        record_id: parse_record_id(&record_id)?,
        record_type: record_type.parse()?,
        fields: serde_json::from_str(&fields_json)
            .map_err(|e| LeadGarageError::Storage(format!("invalid fields_json: {e}")))?,
        status: status.parse()?,
        created_at: parse_ts(&created_at)?,
    })
}

/// Convert a database row to a [`RoutingLogEntry`].
fn row_to_routing_entry(row: &libsql::Row) -> Result<RoutingLogEntry> {
    let record_id: String = row.get(1).map_err(db_err)?;
    let record_type: String = row.get(2).map_err(db_err)?;
    let reason_json: String = row.get(5).map_err(db_err)?;
    let disposition: String = row.get(8).map_err(db_err)?;
    let agent_status: String = row.get(9).map_err(db_err)?;
    let fields_json: String = row.get(14).map_err(db_err)?;
    let routed_at: String = row.get(18).map_err(db_err)?;

    Ok(RoutingLogEntry {
        routing_id: row.get::<String>(0).map_err(db_err)?,
        record_id: parse_record_id(&record_id)?,
        record_type: record_type.parse()?,
        garage_bay: row
            .get::<String>(3)
            .ok()
            .map(|s| s.parse())
            .transpose()?,
        capability_assigned: row
            .get::<String>(4)
            .ok()
            .map(|s| s.parse())
            .transpose()?,
        routing_reason: serde_json::from_str(&reason_json)
            .map_err(|e| LeadGarageError::Storage(format!("invalid routing_reason_json: {e}")))?,
        repair_attempt_number: row.get::<i64>(6).map_err(db_err)? as u32,
        is_chronic_bad: row.get::<i64>(7).map_err(db_err)? != 0,
        disposition: disposition.parse()?,
        agent_status: agent_status.parse()?,
        failure_type: row
            .get::<String>(10)
            .ok()
            .map(|s| s.parse())
            .transpose()?,
        agent_started_at: row
            .get::<String>(11)
            .ok()
            .map(|s| parse_ts(&s))
            .transpose()?,
        agent_completed_at: row
            .get::<String>(12)
            .ok()
            .map(|s| parse_ts(&s))
            .transpose()?,
        agent_cost: row.get::<f64>(13).unwrap_or(0.0),
        fields_repaired: serde_json::from_str(&fields_json)
            .map_err(|e| LeadGarageError::Storage(format!("invalid fields_repaired: {e}")))?,
        confidence: row.get::<i64>(15).map_err(db_err)?.clamp(0, 100) as u8,
        hub_signal: row
            .get::<String>(16)
            .ok()
            .map(|s| s.parse())
            .transpose()?,
        denial_reason: row.get::<String>(17).ok(),
        routed_at: parse_ts(&routed_at)?,
    })
}
