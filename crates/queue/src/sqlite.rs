//! SQLite-backed durable queue.
//!
//! All channels live in one database. Several processes may share the same
//! file: leasing runs inside an IMMEDIATE transaction, so a message is never
//! leased to two receivers at once. Receivers in this process are woken by
//! publishes through a [`Notify`]; messages published by other processes are
//! picked up on the next poll tick.

use crate::queue::{DeadLetter, Delivery, DurableQueue, QueueStats};
use askq_core::config::QueueSettings;
use askq_core::{AppError, AppResult};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Path value that selects an in-memory database.
pub const IN_MEMORY: &str = ":memory:";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery policy of a [`SqliteQueue`].
#[derive(Debug, Clone, Copy)]
pub struct SqliteQueueConfig {
    /// Lease duration; an unacknowledged message is redelivered afterwards
    pub visibility_timeout: Duration,

    /// Deliveries allowed before a message is dead-lettered
    pub max_deliveries: u32,

    /// Upper bound on how long a waiting receiver sleeps between checks
    pub poll_interval: Duration,
}

impl Default for SqliteQueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for SqliteQueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            visibility_timeout: settings.visibility_timeout(),
            max_deliveries: settings.max_deliveries,
            poll_interval: settings.poll_interval(),
        }
    }
}

/// Durable queue stored in SQLite.
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
    config: SqliteQueueConfig,
}

fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> AppError {
    move |e| AppError::Queue(format!("{}: {}", context, e))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`.
    ///
    /// `:memory:` opens a private in-memory queue, useful for tests and
    /// single-process deployments.
    pub fn open(path: &Path, config: SqliteQueueConfig) -> AppResult<Self> {
        if path.as_os_str() == IN_MEMORY {
            return Self::open_in_memory(config);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Queue(format!("Failed to create queue directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(sql_err("Failed to open queue database"))?;

        // WAL lets readers in other processes proceed while a lease is taken
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(sql_err("Failed to enable WAL"))?;
        tracing::trace!("Queue journal mode: {}", mode);
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err("Failed to set synchronous mode"))?;

        tracing::debug!("Opened durable queue at {:?}", path);
        Self::with_connection(conn, config)
    }

    /// Open a queue that lives only in this process.
    pub fn open_in_memory(config: SqliteQueueConfig) -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err("Failed to open in-memory queue"))?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: SqliteQueueConfig) -> AppResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(sql_err("Failed to set busy timeout"))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                payload BLOB NOT NULL,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                lease TEXT,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_ready
                ON messages(channel, visible_at, id);

            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                channel TEXT NOT NULL,
                payload BLOB NOT NULL,
                enqueued_at INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                quarantined_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dead_letters_channel
                ON dead_letters(channel, quarantined_at);
            "#,
        )
        .map_err(sql_err("Failed to create queue tables"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
            config,
        })
    }

    pub fn config(&self) -> &SqliteQueueConfig {
        &self.config
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AppError::Queue("Queue connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| AppError::Queue(format!("Queue task failed: {}", e)))?
    }

    /// One non-blocking lease attempt. Messages that exhausted their
    /// deliveries are moved to `dead_letters` on the way.
    async fn try_receive(&self, channel: &str) -> AppResult<Option<Delivery>> {
        let channel = channel.to_string();
        let config = self.config;

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to begin lease transaction"))?;

            loop {
                let now = now_ms();
                let row = tx
                    .query_row(
                        "SELECT id, payload, delivery_count FROM messages
                         WHERE channel = ?1 AND visible_at <= ?2
                         ORDER BY id LIMIT 1",
                        params![channel, now],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, Vec<u8>>(1)?,
                                row.get::<_, u32>(2)?,
                            ))
                        },
                    )
                    .optional()
                    .map_err(sql_err("Failed to select message"))?;

                let Some((id, payload, delivery_count)) = row else {
                    tx.commit().map_err(sql_err("Failed to commit"))?;
                    return Ok(None);
                };

                if delivery_count >= config.max_deliveries {
                    let reason = format!(
                        "exceeded {} deliveries without acknowledgment",
                        config.max_deliveries
                    );
                    move_to_dead_letters(&tx, id, None, &reason)?;
                    tracing::warn!(
                        "Dead-lettered message {} on '{}' after {} deliveries",
                        id,
                        channel,
                        delivery_count
                    );
                    continue;
                }

                let lease = uuid::Uuid::new_v4().to_string();
                let visible_at = now + config.visibility_timeout.as_millis() as i64;

                tx.execute(
                    "UPDATE messages
                     SET delivery_count = delivery_count + 1, visible_at = ?1, lease = ?2
                     WHERE id = ?3",
                    params![visible_at, lease, id],
                )
                .map_err(sql_err("Failed to lease message"))?;

                tx.commit().map_err(sql_err("Failed to commit lease"))?;

                return Ok(Some(Delivery {
                    message_id: id,
                    channel: channel.clone(),
                    payload,
                    delivery_count: delivery_count + 1,
                    lease,
                }));
            }
        })
        .await
    }
}

/// Copy a message into `dead_letters` and delete it. When `lease` is given,
/// the move only happens if the lease is still held.
fn move_to_dead_letters(
    conn: &Connection,
    id: i64,
    lease: Option<&str>,
    reason: &str,
) -> AppResult<bool> {
    let inserted = conn
        .execute(
            "INSERT INTO dead_letters
                 (message_id, channel, payload, enqueued_at, delivery_count, reason, quarantined_at)
             SELECT id, channel, payload, enqueued_at, delivery_count,
                    COALESCE(last_error || ' (' || ?2 || ')', ?2), ?3
             FROM messages
             WHERE id = ?1 AND (?4 IS NULL OR lease = ?4)",
            params![id, reason, now_ms(), lease],
        )
        .map_err(sql_err("Failed to dead-letter message"))?;

    if inserted == 0 {
        return Ok(false);
    }

    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
        .map_err(sql_err("Failed to remove dead-lettered message"))?;

    Ok(true)
}

#[async_trait::async_trait]
impl DurableQueue for SqliteQueue {
    async fn publish(&self, channel: &str, payload: &[u8]) -> AppResult<i64> {
        let channel_name = channel.to_string();
        let payload = payload.to_vec();

        let id = self
            .with_conn(move |conn| {
                let now = now_ms();
                conn.execute(
                    "INSERT INTO messages (channel, payload, enqueued_at, visible_at)
                     VALUES (?1, ?2, ?3, ?3)",
                    params![channel_name, payload, now],
                )
                .map_err(sql_err("Failed to publish message"))?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::trace!("Published message {} to '{}'", id, channel);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, channel: &str, wait: Duration) -> AppResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a concurrent publish is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_receive(channel).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let nap = (deadline - now).min(self.config.poll_interval);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        let id = delivery.message_id;
        let lease = delivery.lease.clone();

        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM messages WHERE id = ?1 AND lease = ?2",
                    params![id, lease],
                )
                .map_err(sql_err("Failed to acknowledge message"))
            })
            .await?;

        if removed == 0 {
            return Err(AppError::LeaseExpired(id));
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration, reason: &str) -> AppResult<()> {
        let id = delivery.message_id;
        let lease = delivery.lease.clone();
        let reason = reason.to_string();

        let updated = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE messages SET visible_at = ?1, lease = NULL, last_error = ?2
                     WHERE id = ?3 AND lease = ?4",
                    params![now_ms() + delay.as_millis() as i64, reason, id, lease],
                )
                .map_err(sql_err("Failed to release message"))
            })
            .await?;

        if updated == 0 {
            return Err(AppError::LeaseExpired(id));
        }

        if delay.is_zero() {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let id = delivery.message_id;
        let lease = delivery.lease.clone();
        let reason = reason.to_string();

        let moved = self
            .with_conn(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err("Failed to begin dead-letter transaction"))?;
                let moved = move_to_dead_letters(&tx, id, Some(lease.as_str()), &reason)?;
                tx.commit().map_err(sql_err("Failed to commit dead-letter"))?;
                Ok(moved)
            })
            .await?;

        if !moved {
            return Err(AppError::LeaseExpired(id));
        }
        Ok(())
    }

    async fn dead_letters(&self, channel: &str, limit: usize) -> AppResult<Vec<DeadLetter>> {
        let channel = channel.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, channel, payload, delivery_count, reason, quarantined_at
                     FROM dead_letters WHERE channel = ?1
                     ORDER BY quarantined_at DESC, id DESC LIMIT ?2",
                )
                .map_err(sql_err("Failed to prepare dead-letter query"))?;

            let rows = stmt
                .query_map(params![channel, limit as i64], |row| {
                    let quarantined_ms: i64 = row.get(5)?;
                    Ok(DeadLetter {
                        message_id: row.get(0)?,
                        channel: row.get(1)?,
                        payload: row.get(2)?,
                        delivery_count: row.get(3)?,
                        reason: row.get(4)?,
                        quarantined_at: Utc
                            .timestamp_millis_opt(quarantined_ms)
                            .single()
                            .unwrap_or_else(Utc::now),
                    })
                })
                .map_err(sql_err("Failed to query dead letters"))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("Failed to read dead letter"))
        })
        .await
    }

    async fn stats(&self, channel: &str) -> AppResult<QueueStats> {
        let channel = channel.to_string();

        self.with_conn(move |conn| {
            let now = now_ms();
            let (ready, in_flight): (i64, i64) = conn
                .query_row(
                    "SELECT
                         COALESCE(SUM(CASE WHEN visible_at <= ?2 THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE WHEN visible_at > ?2 THEN 1 ELSE 0 END), 0)
                     FROM messages WHERE channel = ?1",
                    params![channel, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(sql_err("Failed to count messages"))?;

            let dead_lettered: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM dead_letters WHERE channel = ?1",
                    params![channel],
                    |row| row.get(0),
                )
                .map_err(sql_err("Failed to count dead letters"))?;

            Ok(QueueStats {
                ready: ready as u64,
                in_flight: in_flight as u64,
                dead_lettered: dead_lettered as u64,
            })
        })
        .await
    }
}
