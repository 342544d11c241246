//! SQL migration definitions for the LeadGarage database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: records, routing_log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Lead records awaiting (or done with) enrichment
CREATE TABLE IF NOT EXISTS records (
    record_id   TEXT PRIMARY KEY,
    record_type TEXT NOT NULL,
    fields_json TEXT NOT NULL DEFAULT '{}',
    status      TEXT NOT NULL DEFAULT 'invalid',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_queue ON records(record_type, status, created_at);

-- One row per routing cycle
CREATE TABLE IF NOT EXISTS routing_log (
    routing_id            TEXT PRIMARY KEY,
    record_id             TEXT NOT NULL REFERENCES records(record_id),
    record_type           TEXT NOT NULL,
    garage_bay            TEXT,
    capability_assigned   TEXT,
    routing_reason        TEXT NOT NULL,
    routing_reason_json   TEXT NOT NULL,
    repair_attempt_number INTEGER NOT NULL,
    is_chronic_bad        INTEGER NOT NULL DEFAULT 0,
    disposition           TEXT NOT NULL,
    agent_status          TEXT NOT NULL,
    failure_type          TEXT,
    agent_started_at      TEXT,
    agent_completed_at    TEXT,
    agent_cost            REAL NOT NULL DEFAULT 0,
    fields_repaired       TEXT NOT NULL DEFAULT '{}',
    confidence            INTEGER NOT NULL DEFAULT 0,
    hub_signal            TEXT,
    denial_reason         TEXT,
    routed_at             TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_routing_log_record ON routing_log(record_id, routed_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Append-only guards on routing_log",
            sql: r#"
CREATE TRIGGER IF NOT EXISTS routing_log_no_update BEFORE UPDATE ON routing_log BEGIN
    SELECT RAISE(ABORT, 'routing_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS routing_log_no_delete BEFORE DELETE ON routing_log BEGIN
    SELECT RAISE(ABORT, 'routing_log is append-only');
END;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
