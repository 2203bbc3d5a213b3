//! Durable SQLite mailbox
//!
//! Each call opens its own connection on the blocking pool, so the store is
//! cheap to clone and safe to share between request handlers.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Mailbox, SignalingMessage};
use crate::session::ParticipantId;
use crate::{Error, Result};

/// Messages older than this are purged (signaling is useless after a call
/// attempt has been abandoned)
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

const MAX_TTL: Duration = Duration::from_secs(24 * 3600);

/// How long a writer waits for another connection's transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteMailbox {
    db_path: PathBuf,
    ttl: Duration,
    max_per_recipient: usize,
}

impl SqliteMailbox {
    /// Open (creating if needed) the mailbox database at `db_path`
    pub fn open(db_path: impl AsRef<Path>, ttl: Duration, max_per_recipient: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            ttl: ttl.clamp(Duration::from_secs(1), MAX_TTL),
            max_per_recipient: max_per_recipient.max(1),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Number of unexpired messages waiting for `recipient`
    pub async fn pending(&self, recipient: &ParticipantId) -> Result<usize> {
        let db_path = self.db_path.clone();
        let recipient = recipient.to_string();
        run_blocking(move || {
            let conn = connect(&db_path)?;
            purge_expired(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM signaling_messages WHERE recipient = ?1",
                params![recipient],
                |r| r.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
        .await
    }
}

#[async_trait]
impl Mailbox for SqliteMailbox {
    async fn push(&self, message: SignalingMessage) -> Result<()> {
        let db_path = self.db_path.clone();
        let body = serde_json::to_vec(&message)?;
        let ttl_ms = self.ttl.as_millis().min(i64::MAX as u128) as i64;
        let max_per_recipient = self.max_per_recipient as i64;

        run_blocking(move || {
            let mut conn = connect(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms();
            tx.execute(
                "DELETE FROM signaling_messages WHERE expires_at_ms <= ?1",
                params![now],
            )?;

            let queued: i64 = tx.query_row(
                "SELECT COUNT(*) FROM signaling_messages WHERE recipient = ?1",
                params![message.recipient.as_str()],
                |r| r.get(0),
            )?;
            if queued >= max_per_recipient {
                warn!(
                    "Mailbox for {} is full ({} messages), rejecting {}",
                    message.recipient, queued, message.id
                );
                return Err(Error::SignalingError(format!(
                    "mailbox for {} is full",
                    message.recipient
                )));
            }

            // A redelivered message keeps its original queue position
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM signaling_messages WHERE id = ?1",
                    params![message.id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_none() {
                tx.execute(
                    r#"
                    INSERT INTO signaling_messages (id, recipient, sender, created_at_ms, expires_at_ms, body)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        message.id.to_string(),
                        message.recipient.as_str(),
                        message.sender.as_str(),
                        now,
                        now.saturating_add(ttl_ms),
                        body
                    ],
                )?;
            }
            tx.commit()?;
            debug!("Stored {} {} for {}", message.kind(), message.id, message.recipient);
            Ok(())
        })
        .await
    }

    async fn drain(&self, recipient: &ParticipantId, limit: usize) -> Result<Vec<SignalingMessage>> {
        let db_path = self.db_path.clone();
        let recipient = recipient.to_string();
        let limit = limit.clamp(1, 200) as i64;

        run_blocking(move || {
            let mut conn = connect(&db_path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM signaling_messages WHERE expires_at_ms <= ?1",
                params![now_ms()],
            )?;

            let rows = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT seq, body FROM signaling_messages
                    WHERE recipient = ?1
                    ORDER BY seq ASC
                    LIMIT ?2
                    "#,
                )?;
                let rows = stmt
                    .query_map(params![recipient, limit], |r| {
                        Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut out = Vec::with_capacity(rows.len());
            for (seq, body) in rows {
                tx.execute("DELETE FROM signaling_messages WHERE seq = ?1", params![seq])?;
                match serde_json::from_slice::<SignalingMessage>(&body) {
                    Ok(message) => out.push(message),
                    Err(e) => warn!("Dropping unreadable mailbox row {}: {}", seq, e),
                }
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::StorageError(format!("mailbox task failed: {}", e)))?
}

/// Connection whose transactions wait for concurrent writers
///
/// Mailbox transactions are opened `IMMEDIATE` so a count and the insert
/// that follows it see the same queue.
fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn purge_expired(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM signaling_messages WHERE expires_at_ms <= ?1",
        params![now_ms()],
    )?)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path)
        .map_err(|e| Error::StorageError(format!("open {}: {}", path.display(), e)))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS signaling_messages (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          recipient TEXT NOT NULL,
          sender TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL,
          body BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS signaling_messages_recipient
          ON signaling_messages(recipient, seq);
        CREATE INDEX IF NOT EXISTS signaling_messages_expiry
          ON signaling_messages(expires_at_ms);
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
