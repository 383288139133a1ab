//! C3: embedded transactional message store (§4.1).
//!
//! Built on `rusqlite` with a bundled SQLite, following the teacher's
//! `MemoryDb` shape in structure (`open_or_create`, `apply_pragmas`,
//! `init_schema`, a `config` key/value table) almost verbatim, generalized
//! from a document/frame store to the `messages`/`queue_meta` schema this
//! spec calls for. A single mutex-guarded `Connection` stands in for the
//! spec's "connection pool" — see `SPEC_FULL.md` §4.1/§9 for why that is
//! sufficient here: WAL mode already gives concurrent readers against the
//! one writer, and a single connection trivially satisfies "no caller may
//! hold two connections simultaneously".

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::TracedError;

pub(crate) const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MessageType {
    Text,
    Image,
    File,
    Media,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Media => "media",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "image" => MessageType::Image,
            "file" => MessageType::File,
            "media" => MessageType::Media,
            _ => MessageType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MessageStatus {
    Pending,
    Inflight,
    Failed,
    Acked,
}

impl MessageStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Inflight => "inflight",
            MessageStatus::Failed => "failed",
            MessageStatus::Acked => "acked",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "inflight" => MessageStatus::Inflight,
            "failed" => MessageStatus::Failed,
            "acked" => MessageStatus::Acked,
            _ => MessageStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Attachment {
    pub(crate) id: String,
    pub(crate) url: String,
    pub(crate) mime_type: String,
    pub(crate) size: u64,
    pub(crate) filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Message {
    pub(crate) id: String,
    pub(crate) platform: String,
    pub(crate) target_room: String,
    pub(crate) target_channel: String,
    #[serde(rename = "type")]
    pub(crate) kind: MessageType,
    pub(crate) content: String,
    pub(crate) attachments: Vec<Attachment>,
    pub(crate) reply_to: Option<String>,
    pub(crate) metadata: std::collections::BTreeMap<String, String>,
    pub(crate) signature: String,
    pub(crate) priority: i32,
    pub(crate) attempts: u32,
    pub(crate) max_attempts: u32,
    pub(crate) created_at: i64,
    pub(crate) next_retry: Option<i64>,
    pub(crate) last_attempt: Option<i64>,
    pub(crate) error_message: Option<String>,
    pub(crate) status: MessageStatus,
    pub(crate) expires_at: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct StatusCounts {
    pub(crate) pending: u64,
    pub(crate) inflight: u64,
    pub(crate) failed: u64,
    pub(crate) acked: u64,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    platform        TEXT NOT NULL,
    target_room     TEXT NOT NULL DEFAULT '',
    target_channel  TEXT NOT NULL DEFAULT '',
    kind            TEXT NOT NULL DEFAULT 'text',
    content         TEXT NOT NULL DEFAULT '',
    attachments     BLOB NOT NULL DEFAULT X'',
    reply_to        TEXT,
    metadata        BLOB NOT NULL DEFAULT X'',
    signature       TEXT NOT NULL DEFAULT '',
    priority        INTEGER NOT NULL DEFAULT 5,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 3,
    created_at      INTEGER NOT NULL,
    next_retry      INTEGER,
    last_attempt    INTEGER,
    error_message   TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    expires_at      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_dequeue
    ON messages(status, priority DESC, created_at ASC);

CREATE INDEX IF NOT EXISTS idx_messages_next_retry
    ON messages(next_retry) WHERE next_retry IS NOT NULL;

CREATE TABLE IF NOT EXISTS queue_meta (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

pub(crate) struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    pub(crate) fn open_or_create(path: &Path) -> Result<Self, TracedError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TracedError::new(crate::error::ErrorKind::InternalError, "cannot create db dir")
                    .with_cause(e)
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -8000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        let store = MessageStore {
            conn: Mutex::new(conn),
        };
        store.ensure_schema_version()?;
        Ok(store)
    }

    fn ensure_schema_version(&self) -> Result<(), TracedError> {
        if self.config_get("schema_version").is_none() {
            self.config_set("schema_version", &SCHEMA_VERSION.to_be_bytes())?;
        }
        Ok(())
    }

    pub(crate) fn schema_version(&self) -> i64 {
        self.config_get("schema_version")
            .and_then(|bytes| bytes.try_into().ok())
            .map(i64::from_be_bytes)
            .unwrap_or(0)
    }

    // ── queue_meta key/value ────────────────────────────────────────

    pub(crate) fn config_get(&self, key: &str) -> Option<Vec<u8>> {
        self.conn
            .lock()
            .query_row("SELECT value FROM queue_meta WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .ok()
    }

    pub(crate) fn config_set(&self, key: &str, value: &[u8]) -> Result<(), TracedError> {
        self.conn.lock().execute(
            "INSERT INTO queue_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ── messages ──────────────────────────────────────────────────────

    pub(crate) fn insert(&self, msg: &Message) -> Result<(), TracedError> {
        let attachments = serde_json::to_vec(&msg.attachments).unwrap_or_default();
        let metadata = serde_json::to_vec(&msg.metadata).unwrap_or_default();
        self.conn.lock().execute(
            "INSERT INTO messages (
                id, platform, target_room, target_channel, kind, content,
                attachments, reply_to, metadata, signature, priority, attempts,
                max_attempts, created_at, next_retry, last_attempt, error_message,
                status, expires_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            params![
                msg.id,
                msg.platform,
                msg.target_room,
                msg.target_channel,
                msg.kind.as_str(),
                msg.content,
                attachments,
                msg.reply_to,
                metadata,
                msg.signature,
                msg.priority,
                msg.attempts,
                msg.max_attempts,
                msg.created_at,
                msg.next_retry,
                msg.last_attempt,
                msg.error_message,
                msg.status.as_str(),
                msg.expires_at,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn exists(&self, id: &str) -> bool {
        self.conn
            .lock()
            .query_row("SELECT 1 FROM messages WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .unwrap_or(None)
            .is_some()
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let attachments_bytes: Vec<u8> = row.get("attachments")?;
        let metadata_bytes: Vec<u8> = row.get("metadata")?;
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        Ok(Message {
            id: row.get("id")?,
            platform: row.get("platform")?,
            target_room: row.get("target_room")?,
            target_channel: row.get("target_channel")?,
            kind: MessageType::from_str(&kind),
            content: row.get("content")?,
            attachments: serde_json::from_slice(&attachments_bytes).unwrap_or_default(),
            reply_to: row.get("reply_to")?,
            metadata: serde_json::from_slice(&metadata_bytes).unwrap_or_default(),
            signature: row.get("signature")?,
            priority: row.get("priority")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            max_attempts: row.get::<_, i64>("max_attempts")? as u32,
            created_at: row.get("created_at")?,
            next_retry: row.get("next_retry")?,
            last_attempt: row.get("last_attempt")?,
            error_message: row.get("error_message")?,
            status: MessageStatus::from_str(&status),
            expires_at: row.get("expires_at")?,
        })
    }

    /// Atomically select the next dequeuable row and flip it to `inflight`,
    /// returning it. Implements the Redesign Flag from spec §9: the
    /// predicate treats `next_retry IS NULL OR next_retry <= now` as due,
    /// so no separate sweep is required for correctness (only for making
    /// the due rows visible to a plain `next_retry IS NULL` scan elsewhere).
    pub(crate) fn dequeue_one(&self, now: i64) -> Result<Option<Message>, TracedError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let row: Option<Message> = tx
            .query_row(
                "SELECT * FROM messages
                 WHERE status = 'pending'
                   AND (expires_at IS NULL OR expires_at > ?1)
                   AND (next_retry IS NULL OR next_retry <= ?1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1",
                params![now],
                Self::row_to_message,
            )
            .optional()?;
        if let Some(msg) = &row {
            tx.execute(
                "UPDATE messages SET status = 'inflight', last_attempt = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![msg.id, now],
            )?;
        }
        tx.commit()?;
        Ok(row)
    }

    /// Batch variant of [`dequeue_one`]; all selected rows flip to inflight
    /// within the same transaction.
    pub(crate) fn dequeue_batch(&self, now: i64, limit: u32) -> Result<Vec<Message>, TracedError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids: Vec<Message> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM messages
                 WHERE status = 'pending'
                   AND (expires_at IS NULL OR expires_at > ?1)
                   AND (next_retry IS NULL OR next_retry <= ?1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit], Self::row_to_message)?;
            rows.collect::<Result<_, _>>()?
        };
        for msg in &ids {
            tx.execute(
                "UPDATE messages SET status = 'inflight', last_attempt = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![msg.id, now],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// `UPDATE messages SET status='acked' WHERE id=? AND status='inflight'`.
    /// Returns whether a row was actually updated.
    pub(crate) fn ack(&self, id: &str) -> Result<bool, TracedError> {
        let n = self.conn.lock().execute(
            "UPDATE messages SET status = 'acked' WHERE id = ?1 AND status = 'inflight'",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub(crate) fn get(&self, id: &str) -> Option<Message> {
        self.conn
            .lock()
            .query_row("SELECT * FROM messages WHERE id = ?1", params![id], Self::row_to_message)
            .optional()
            .ok()
            .flatten()
    }

    /// Persist a nack outcome: either terminal `failed` or rescheduled
    /// `pending` with a new `next_retry`.
    pub(crate) fn apply_nack(
        &self,
        id: &str,
        attempts: u32,
        status: MessageStatus,
        next_retry: Option<i64>,
        error_message: &str,
    ) -> Result<bool, TracedError> {
        let n = self.conn.lock().execute(
            "UPDATE messages
             SET attempts = ?2, status = ?3, next_retry = ?4, error_message = ?5
             WHERE id = ?1 AND status = 'inflight'",
            params![id, attempts, status.as_str(), next_retry, error_message],
        )?;
        Ok(n > 0)
    }

    pub(crate) fn pending_count(&self) -> Result<u64, TracedError> {
        let n: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM messages WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub(crate) fn count_by_status(&self) -> Result<StatusCounts, TracedError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (status, count) = row?;
            match MessageStatus::from_str(&status) {
                MessageStatus::Pending => counts.pending = count,
                MessageStatus::Inflight => counts.inflight = count,
                MessageStatus::Failed => counts.failed = count,
                MessageStatus::Acked => counts.acked = count,
            }
        }
        Ok(counts)
    }

    /// Delete rows with `expires_at < now`. Returns the count deleted.
    pub(crate) fn delete_expired(&self, now: i64) -> Result<u64, TracedError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?1", params![now])?;
        Ok(n as u64)
    }

    /// Rows sitting in terminal `failed` status, oldest first — the
    /// operator-facing "review the dead-letter queue" read path.
    pub(crate) fn list_failed(&self) -> Result<Vec<Message>, TracedError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM messages WHERE status = 'failed' ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], Self::row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Explicit DLQ revival: a `failed` row goes back to `pending` with a
    /// clean attempt counter, as if newly enqueued.
    pub(crate) fn revive_failed(&self, id: &str) -> Result<bool, TracedError> {
        let n = self.conn.lock().execute(
            "UPDATE messages
             SET status = 'pending', attempts = 0, next_retry = NULL, error_message = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Permanently remove a `failed` row (operator-confirmed DLQ clear).
    pub(crate) fn delete_failed(&self, id: &str) -> Result<bool, TracedError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM messages WHERE id = ?1 AND status = 'failed'", params![id])?;
        Ok(n > 0)
    }

    /// Null out `next_retry` for pending rows whose retry time is due.
    /// Per spec §9's recorded Open Question: the only observable effect is
    /// clearing `next_retry`; the returned count is "rows touched", not
    /// "messages newly dequeuable" (the dequeue predicate already treats a
    /// due-but-non-null `next_retry` as eligible).
    pub(crate) fn sweep_retry_ready(&self, now: i64) -> Result<u64, TracedError> {
        let n = self.conn.lock().execute(
            "UPDATE messages SET next_retry = NULL
             WHERE status = 'pending' AND next_retry IS NOT NULL AND next_retry <= ?1",
            params![now],
        )?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open_or_create(&dir.path().join("bridge.db")).unwrap();
        (dir, store)
    }

    fn sample(id: &str, priority: i32, created_at: i64) -> Message {
        Message {
            id: id.to_string(),
            platform: "slack".to_string(),
            target_room: "general".to_string(),
            target_channel: "C1".to_string(),
            kind: MessageType::Text,
            content: "hello".to_string(),
            attachments: vec![],
            reply_to: None,
            metadata: Default::default(),
            signature: "sig".to_string(),
            priority,
            attempts: 0,
            max_attempts: 3,
            created_at,
            next_retry: None,
            last_attempt: None,
            error_message: None,
            status: MessageStatus::Pending,
            expires_at: None,
        }
    }

    #[test]
    fn insert_then_dequeue_round_trips_fields() {
        let (_dir, store) = temp_store();
        let msg = sample("a", 5, 1000);
        store.insert(&msg).unwrap();
        let dequeued = store.dequeue_one(2000).unwrap().unwrap();
        assert_eq!(dequeued.id, "a");
        assert_eq!(dequeued.content, "hello");
        assert_eq!(dequeued.status, MessageStatus::Inflight);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let (_dir, store) = temp_store();
        store.insert(&sample("a", 5, 1)).unwrap();
        store.insert(&sample("b", 5, 2)).unwrap();
        store.insert(&sample("c", 5, 3)).unwrap();
        assert_eq!(store.dequeue_one(100).unwrap().unwrap().id, "a");
        assert_eq!(store.dequeue_one(100).unwrap().unwrap().id, "b");
        assert_eq!(store.dequeue_one(100).unwrap().unwrap().id, "c");
    }

    #[test]
    fn priority_overrides_age() {
        let (_dir, store) = temp_store();
        store.insert(&sample("low", 1, 1)).unwrap();
        store.insert(&sample("high", 9, 2)).unwrap();
        assert_eq!(store.dequeue_one(100).unwrap().unwrap().id, "high");
        assert_eq!(store.dequeue_one(100).unwrap().unwrap().id, "low");
    }

    #[test]
    fn ack_requires_inflight() {
        let (_dir, store) = temp_store();
        store.insert(&sample("a", 5, 1)).unwrap();
        assert!(!store.ack("a").unwrap());
        store.dequeue_one(100).unwrap();
        assert!(store.ack("a").unwrap());
        assert!(!store.ack("a").unwrap());
    }

    #[test]
    fn expired_messages_are_never_dequeued() {
        let (_dir, store) = temp_store();
        let mut msg = sample("a", 5, 1);
        msg.expires_at = Some(50);
        store.insert(&msg).unwrap();
        assert!(store.dequeue_one(100).unwrap().is_none());
        assert_eq!(store.delete_expired(100).unwrap(), 1);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn duplicate_id_insert_fails() {
        let (_dir, store) = temp_store();
        store.insert(&sample("a", 5, 1)).unwrap();
        assert!(store.insert(&sample("a", 5, 2)).is_err());
    }

    #[test]
    fn reopening_existing_store_preserves_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let store1 = MessageStore::open_or_create(&path).unwrap();
        let v1 = store1.schema_version();
        drop(store1);
        let store2 = MessageStore::open_or_create(&path).unwrap();
        assert_eq!(v1, store2.schema_version());
        assert_eq!(v1, SCHEMA_VERSION);
    }

    #[test]
    fn batch_dequeue_marks_all_inflight_in_one_transaction() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            store.insert(&sample(&format!("m{i}"), 5, i as i64)).unwrap();
        }
        let batch = store.dequeue_batch(100, 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(store.pending_count().unwrap(), 2);
    }

    #[test]
    fn sweep_retry_ready_clears_due_next_retry() {
        let (_dir, store) = temp_store();
        let mut msg = sample("a", 5, 1);
        msg.next_retry = Some(50);
        store.insert(&msg).unwrap();
        assert!(store.dequeue_one(10).unwrap().is_none());
        let touched = store.sweep_retry_ready(100).unwrap();
        assert_eq!(touched, 1);
        assert!(store.dequeue_one(100).unwrap().is_some());
    }

    #[test]
    fn failed_rows_are_listed_revived_or_deleted() {
        let (_dir, store) = temp_store();
        let mut msg = sample("a", 5, 1);
        msg.status = MessageStatus::Failed;
        msg.attempts = 3;
        msg.error_message = Some("net".to_string());
        store.insert(&msg).unwrap();

        let failed = store.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "a");

        assert!(store.revive_failed("a").unwrap());
        assert_eq!(store.list_failed().unwrap().len(), 0);
        let revived = store.get("a").unwrap();
        assert_eq!(revived.status, MessageStatus::Pending);
        assert_eq!(revived.attempts, 0);

        store.conn.lock().execute(
            "UPDATE messages SET status = 'failed' WHERE id = 'a'",
            [],
        ).unwrap();
        assert!(store.delete_failed("a").unwrap());
        assert!(store.get("a").is_none());
        assert!(!store.delete_failed("a").unwrap());
    }

    #[test]
    fn attachments_and_metadata_round_trip() {
        let (_dir, store) = temp_store();
        let mut msg = sample("a", 5, 1);
        msg.attachments.push(Attachment {
            id: "att1".to_string(),
            url: "https://example.com/f.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 1024,
            filename: "f.png".to_string(),
        });
        msg.metadata.insert("k".to_string(), "v".to_string());
        store.insert(&msg).unwrap();
        let dequeued = store.dequeue_one(100).unwrap().unwrap();
        assert_eq!(dequeued.attachments.len(), 1);
        assert_eq!(dequeued.attachments[0].filename, "f.png");
        assert_eq!(dequeued.metadata.get("k").unwrap(), "v");
    }
}
