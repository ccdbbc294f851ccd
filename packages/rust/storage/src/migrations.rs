//! SQL migration definitions for the Conveyor log database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: log_streams, log_events",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Named log streams
CREATE TABLE IF NOT EXISTS log_streams (
    group_name  TEXT NOT NULL,
    stream_name TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (group_name, stream_name)
);

-- Append-only events; the rowid doubles as the forward token
CREATE TABLE IF NOT EXISTS log_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name  TEXT NOT NULL,
    stream_name TEXT NOT NULL,
    data        BLOB NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_log_events_stream
    ON log_events(group_name, stream_name, id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
