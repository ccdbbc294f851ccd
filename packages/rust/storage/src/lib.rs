//! Turso Embedded / libSQL storage for build log streams.
//!
//! The [`Storage`] struct wraps a libSQL database holding log streams and
//! their events, and implements [`LogTransport`] so a worker process can write
//! build logs that a separate `conveyor logs` process tails.
//!
//! **Access rules:**
//! - Workers: read-write via [`Storage::open`]
//! - Log viewers: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};

use conveyor_logs::{EventPage, LogTransport, StreamName};
use conveyor_shared::{ConveyorError, Result};

/// Maximum events returned by one `get_events` call.
const PAGE_LIMIT: i64 = 1_000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConveyorError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ConveyorError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ConveyorError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for log viewers).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ConveyorError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ConveyorError::Storage(e.to_string()))?;

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
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ConveyorError::Storage(format!("migration v{} failed: {e}", migration.version))
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
            return Err(ConveyorError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream operations
    // -----------------------------------------------------------------------

    /// Whether a stream exists.
    pub async fn stream_exists(&self, name: &StreamName) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM log_streams WHERE group_name = ?1 AND stream_name = ?2",
                params![name.group.as_str(), name.stream.as_str()],
            )
            .await
            .map_err(|e| ConveyorError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(ConveyorError::Storage(e.to_string())),
        }
    }
}

fn log_error(name: &StreamName, e: impl std::fmt::Display) -> ConveyorError {
    ConveyorError::LogTransport(format!("{name}: {e}"))
}

#[async_trait]
impl LogTransport for Storage {
    async fn create_stream(&self, name: &StreamName) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO log_streams (group_name, stream_name, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_name, stream_name) DO NOTHING",
                params![name.group.as_str(), name.stream.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| log_error(name, e))?;
        Ok(())
    }

    async fn put_events(&self, name: &StreamName, events: &[Vec<u8>]) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        for event in events {
            self.conn
                .execute(
                    "INSERT INTO log_events (group_name, stream_name, data, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        name.group.as_str(),
                        name.stream.as_str(),
                        event.clone(),
                        now.as_str()
                    ],
                )
                .await
                .map_err(|e| log_error(name, e))?;
        }
        Ok(())
    }

    async fn get_events(&self, name: &StreamName, token: Option<&str>) -> Result<EventPage> {
        let after = match token {
            Some(t) => t
                .parse::<i64>()
                .map_err(|_| log_error(name, format!("invalid token '{t}'")))?,
            None => 0,
        };

        let mut rows = self
            .conn
            .query(
                "SELECT id, data FROM log_events
                 WHERE group_name = ?1 AND stream_name = ?2 AND id > ?3
                 ORDER BY id LIMIT ?4",
                params![name.group.as_str(), name.stream.as_str(), after, PAGE_LIMIT],
            )
            .await
            .map_err(|e| log_error(name, e))?;

        let mut page = EventPage::default();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let id = row.get::<i64>(0).map_err(|e| log_error(name, e))?;
                    let data = row.get::<Vec<u8>>(1).map_err(|e| log_error(name, e))?;
                    page.events.push(data);
                    page.next_token = Some(id.to_string());
                }
                Ok(None) => break,
                Err(e) => return Err(log_error(name, e)),
            }
        }
        Ok(page)
    }
}
