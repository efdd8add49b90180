//! Metrics and developer dumps stored in a local SQLite database.
//!
//! Every event string becomes one row tagged with its kind. Writes run on
//! the blocking pool so the runtime's async callers never touch the disk.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use corehost_runtime::{HostFut, PersistError, Persistence};
use rusqlite::{Connection, params};
use tokio::task::spawn_blocking;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Metrics,
    DeveloperDump,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::DeveloperDump => "developer_dump",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub created_at: String,
}

pub struct SqlitePersistence {
    db: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_kind
        ON events(kind);
    ";

    /// Open or create the event store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_private_dir(parent)?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("Failed to open event store at {}", path.display()))?;
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to enable WAL mode")?;
        Self::initialize(db)
    }

    /// Open an in-memory event store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory event store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create events schema")?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Stored events of one kind, oldest first.
    pub fn events(&self, kind: EventKind) -> Result<Vec<StoredEvent>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare(
            "SELECT id, kind, payload, created_at FROM events WHERE kind = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok(StoredEvent {
                id: row.get(0)?,
                kind: row.get(1)?,
                payload: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read events")
    }

    async fn insert(&self, kind: EventKind, events: Vec<String>) -> Result<(), PersistError> {
        let db = Arc::clone(&self.db);
        let count = events.len();
        spawn_blocking(move || insert_events(&db, kind, &events))
            .await
            .map_err(|err| PersistError(format!("persistence task failed: {err}")))?
            .map_err(|err| PersistError(format!("{err:#}")))?;
        debug!(kind = kind.as_str(), count, "events persisted");
        Ok(())
    }
}

fn insert_events(db: &Mutex<Connection>, kind: EventKind, events: &[String]) -> Result<()> {
    let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
    let created_at = Utc::now().to_rfc3339();
    let tx = db.transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO events (kind, payload, created_at) VALUES (?1, ?2, ?3)")?;
        for event in events {
            stmt.execute(params![kind.as_str(), event, created_at])?;
        }
    }
    tx.commit().context("Failed to commit events")
}

impl Persistence for SqlitePersistence {
    fn persist_metrics(&self, events: Vec<String>) -> HostFut<'_, Result<(), PersistError>> {
        Box::pin(self.insert(EventKind::Metrics, events))
    }

    fn persist_developer_dump(
        &self,
        events: Vec<String>,
    ) -> HostFut<'_, Result<(), PersistError>> {
        Box::pin(self.insert(EventKind::DeveloperDump, events))
    }
}

/// Create `path` and, on Unix, restrict it to its owner.
fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to read directory metadata: {}", path.display()))?;

        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() != our_uid {
            return Ok(());
        }

        let current_mode = metadata.permissions().mode() & 0o777;
        if current_mode & 0o077 != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o700)).with_context(|| {
                format!("Failed to set directory permissions: {}", path.display())
            })?;
        }
    }
    Ok(())
}
