use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, Row, TransactionBehavior};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::model::{
    CorrelationKey, Destination, ItemId, PendingItem, QueueItem, SessionId, TenantId, UnixTimeMs,
};

const COMMAND_BUFFER: usize = 64;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const CLAIM_TIMEOUT: Duration = Duration::from_millis(250);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    payload BLOB NOT NULL,
    organization_id TEXT NOT NULL,
    session_id TEXT,
    endpoint TEXT NOT NULL,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_items(next_attempt_at, attempt_count);
CREATE INDEX IF NOT EXISTS idx_queue_created ON queue_items(created_at, id);
"#;

const SELECT_COLUMNS: &str = "id, created_at, attempt_count, next_attempt_at, payload, \
     organization_id, session_id, endpoint, last_error";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue file {} is already open", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("store worker is no longer running")]
    WorkerGone,

    #[error("capacity must be > 0")]
    InvalidCapacity,
}

/// Result of an enqueue: the assigned id (or `None` when the item was
/// dropped) and how many old items were evicted to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: Option<ItemId>,
    pub evicted: u64,
}

impl EnqueueOutcome {
    pub fn was_dropped(&self) -> bool {
        self.id.is_none()
    }
}

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

enum StoreCommand {
    Enqueue {
        item: PendingItem,
        reply: Reply<EnqueueOutcome>,
    },
    FetchReady {
        limit: usize,
        now: UnixTimeMs,
        max_attempts: u32,
        reply: Reply<Vec<QueueItem>>,
    },
    Delete {
        ids: Vec<ItemId>,
        reply: Reply<u64>,
    },
    MarkFailed {
        ids: Vec<ItemId>,
        error: String,
        next_attempt_at: UnixTimeMs,
        reply: Reply<u64>,
    },
    PurgeExhausted {
        max_attempts: u32,
        reply: Reply<Vec<QueueItem>>,
    },
    CountAll {
        reply: Reply<u64>,
    },
    Clear {
        reply: Reply<u64>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Cloneable handle to the worker thread that owns the queue's SQLite
/// connection. Every operation is a message to that thread, and multi-row
/// mutations run in one immediate transaction.
#[derive(Clone, Debug)]
pub struct DurableStore {
    commands: mpsc::Sender<StoreCommand>,
    capacity: u64,
}

impl DurableStore {
    /// Opens (creating if needed) the queue file at `path` and holds an
    /// exclusive lock on it until the store is closed or every handle is
    /// dropped. A second open of a live file fails with
    /// [`QueueError::AlreadyOpen`].
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(CLAIM_TIMEOUT)?;
        let mode = claim(&conn).map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                QueueError::AlreadyOpen(path.to_path_buf())
            }
            _ => QueueError::Database(e),
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!(path = %path.display(), journal_mode = %mode, "opened queue file");

        Self::spawn(conn, capacity)
    }

    pub fn open_in_memory(capacity: u64) -> Result<Self, QueueError> {
        Self::spawn(Connection::open_in_memory()?, capacity)
    }

    fn spawn(conn: Connection, capacity: u64) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity);
        }
        conn.execute_batch(SCHEMA)?;

        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
        let worker = StoreWorker { conn, capacity };
        std::thread::Builder::new()
            .name("tag-queue-store".into())
            .spawn(move || worker.run(inbox))?;

        Ok(Self { commands, capacity })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, QueueError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| QueueError::WorkerGone)?;
        response.await.map_err(|_| QueueError::WorkerGone)?
    }

    /// Inserts a new item, first evicting the oldest items if the queue is at
    /// capacity. Eviction and insert commit together.
    #[instrument(skip(self, item), fields(correlation = %item.correlation_key))]
    pub async fn enqueue(&self, item: PendingItem) -> Result<EnqueueOutcome, QueueError> {
        self.request(|reply| StoreCommand::Enqueue { item, reply })
            .await
    }

    /// Items with `next_attempt_at <= now` and `attempt_count < max_attempts`,
    /// oldest first.
    pub async fn fetch_ready(
        &self,
        limit: usize,
        now: UnixTimeMs,
        max_attempts: u32,
    ) -> Result<Vec<QueueItem>, QueueError> {
        self.request(|reply| StoreCommand::FetchReady {
            limit,
            now,
            max_attempts,
            reply,
        })
        .await
    }

    /// Deletes the given ids. Ids that are already gone are ignored.
    pub async fn delete(&self, ids: Vec<ItemId>) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.request(|reply| StoreCommand::Delete { ids, reply }).await
    }

    /// Increments `attempt_count` and records the error and next attempt time
    /// for every id, in one transaction.
    pub async fn mark_failed(
        &self,
        ids: Vec<ItemId>,
        error: impl Into<String>,
        next_attempt_at: UnixTimeMs,
    ) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let error = error.into();
        self.request(|reply| StoreCommand::MarkFailed {
            ids,
            error,
            next_attempt_at,
            reply,
        })
        .await
    }

    /// Removes and returns items whose `attempt_count` already reached
    /// `max_attempts`. Such rows are never fetched as ready, so without this
    /// they would sit in the queue forever.
    pub async fn purge_exhausted(&self, max_attempts: u32) -> Result<Vec<QueueItem>, QueueError> {
        self.request(|reply| StoreCommand::PurgeExhausted {
            max_attempts,
            reply,
        })
        .await
    }

    pub async fn count_all(&self) -> Result<u64, QueueError> {
        self.request(|reply| StoreCommand::CountAll { reply }).await
    }

    pub async fn clear(&self) -> Result<u64, QueueError> {
        self.request(|reply| StoreCommand::Clear { reply }).await
    }

    /// Stops the worker and releases the queue file once the connection is
    /// closed. Other handles to the same store get
    /// [`QueueError::WorkerGone`] afterwards.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.request(|reply| StoreCommand::Close { reply }).await
    }
}

/// Takes the file lock before anything else touches the database. With
/// `locking_mode = EXCLUSIVE` the lock taken by the first write is kept for
/// the life of the connection, and no shared-memory index is used.
fn claim(conn: &Connection) -> rusqlite::Result<String> {
    let _: String = conn.query_row("PRAGMA locking_mode = EXCLUSIVE", [], |row| row.get(0))?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")?;
    Ok(mode)
}

struct StoreWorker {
    conn: Connection,
    capacity: u64,
}

impl StoreWorker {
    fn run(mut self, mut inbox: mpsc::Receiver<StoreCommand>) {
        let mut closed_by = None;
        while let Some(command) = inbox.blocking_recv() {
            // A dropped reply receiver means the caller went away; the write
            // itself has already been committed or rolled back.
            match command {
                StoreCommand::Enqueue { item, reply } => {
                    let _ = reply.send(self.enqueue(item));
                }
                StoreCommand::FetchReady {
                    limit,
                    now,
                    max_attempts,
                    reply,
                } => {
                    let _ = reply.send(self.fetch_ready(limit, now, max_attempts));
                }
                StoreCommand::Delete { ids, reply } => {
                    let _ = reply.send(self.delete(&ids));
                }
                StoreCommand::MarkFailed {
                    ids,
                    error,
                    next_attempt_at,
                    reply,
                } => {
                    let _ = reply.send(self.mark_failed(&ids, &error, next_attempt_at));
                }
                StoreCommand::PurgeExhausted {
                    max_attempts,
                    reply,
                } => {
                    let _ = reply.send(self.purge_exhausted(max_attempts));
                }
                StoreCommand::CountAll { reply } => {
                    let _ = reply.send(self.count_all());
                }
                StoreCommand::Clear { reply } => {
                    let _ = reply.send(self.clear());
                }
                StoreCommand::Close { reply } => {
                    closed_by = Some(reply);
                    break;
                }
            }
        }

        let closed = self.conn.close().map_err(|(_, e)| QueueError::Database(e));
        if let Err(e) = &closed {
            warn!(error = %e, "queue file did not close cleanly");
        }
        if let Some(reply) = closed_by {
            let _ = reply.send(closed);
        }
        debug!("store worker stopped");
    }

    fn enqueue(&mut self, item: PendingItem) -> Result<EnqueueOutcome, QueueError> {
        let capacity = self.capacity;
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = count_rows(&tx)?;
        let mut evicted = 0u64;
        if current >= capacity {
            let excess = current - capacity + 1;
            evicted = tx.execute(
                "DELETE FROM queue_items WHERE id IN (
                     SELECT id FROM queue_items ORDER BY created_at ASC, id ASC LIMIT ?1
                 )",
                params![to_sql_count(excess)],
            )? as u64;
        }

        if current - evicted >= capacity {
            tx.commit()?;
            warn!(capacity, current, "queue still full after eviction, dropping item");
            return Ok(EnqueueOutcome { id: None, evicted });
        }

        tx.execute(
            "INSERT INTO queue_items
                 (created_at, attempt_count, next_attempt_at, payload, organization_id, session_id, endpoint)
             VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.created_at.as_sql(),
                item.schedule_at.as_sql(),
                item.payload,
                item.correlation_key.tenant_id.as_str(),
                item.correlation_key.session_id.as_ref().map(SessionId::as_str),
                item.destination.as_str(),
            ],
        )?;
        let id = ItemId(tx.last_insert_rowid());
        tx.commit()?;

        if evicted > 0 {
            warn!(evicted, capacity, "queue at capacity, evicted oldest items");
        }
        Ok(EnqueueOutcome {
            id: Some(id),
            evicted,
        })
    }

    fn fetch_ready(
        &self,
        limit: usize,
        now: UnixTimeMs,
        max_attempts: u32,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {SELECT_COLUMNS} FROM queue_items
             WHERE next_attempt_at <= ?1 AND attempt_count < ?2
             ORDER BY created_at ASC, id ASC
             LIMIT ?3"
        ))?;
        let items = stmt
            .query_map(
                params![now.as_sql(), i64::from(max_attempts), to_sql_count(limit as u64)],
                row_to_item,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn delete(&mut self, ids: &[ItemId]) -> Result<u64, QueueError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted = 0u64;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM queue_items WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute(params![id.0])? as u64;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn mark_failed(
        &mut self,
        ids: &[ItemId],
        error: &str,
        next_attempt_at: UnixTimeMs,
    ) -> Result<u64, QueueError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut updated = 0u64;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE queue_items
                 SET attempt_count = attempt_count + 1,
                     next_attempt_at = ?1,
                     last_error = ?2
                 WHERE id = ?3",
            )?;
            for id in ids {
                updated += stmt.execute(params![next_attempt_at.as_sql(), error, id.0])? as u64;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn purge_exhausted(&mut self, max_attempts: u32) -> Result<Vec<QueueItem>, QueueError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM queue_items
                 WHERE attempt_count >= ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let items = stmt
                .query_map(params![i64::from(max_attempts)], row_to_item)?
                .collect::<Result<Vec<_>, _>>()?;
            items
        };
        tx.execute(
            "DELETE FROM queue_items WHERE attempt_count >= ?1",
            params![i64::from(max_attempts)],
        )?;
        tx.commit()?;
        Ok(items)
    }

    fn count_all(&self) -> Result<u64, QueueError> {
        count_rows(&self.conn)
    }

    fn clear(&mut self) -> Result<u64, QueueError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM queue_items", [])? as u64;
        tx.commit()?;
        info!(removed, "queue cleared");
        Ok(removed)
    }
}

fn count_rows(conn: &Connection) -> Result<u64, QueueError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let attempt_count: i64 = row.get(2)?;
    let session_id: Option<String> = row.get(6)?;
    Ok(QueueItem {
        id: ItemId(row.get(0)?),
        created_at: UnixTimeMs::from_sql(row.get(1)?),
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        next_attempt_at: UnixTimeMs::from_sql(row.get(3)?),
        payload: row.get(4)?,
        correlation_key: CorrelationKey::new(
            TenantId::from_stored(row.get(5)?),
            session_id.map(SessionId::from_stored),
        ),
        destination: Destination::from_stored(row.get(7)?),
        last_error: row.get(8)?,
    })
}
