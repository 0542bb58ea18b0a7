//! Embedded SQL store on rusqlite
//!
//! The reference schema: one row per event plus a tag_index side table.
//! Every put runs inside a transaction, so a crash leaves either the
//! pre-write or the post-write state, never a torn event. WAL mode
//! keeps readers off the writer's back.

use super::{sort_backfill, PutOutcome, Store, StoreError};
use aether_core::{Event, EventId, Filter, KindClass, Pubkey, Sig, Tag};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id   BLOB PRIMARY KEY,
    pubkey     BLOB NOT NULL,
    kind       INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    d_value    TEXT NOT NULL DEFAULT '',
    tags_blob  BLOB NOT NULL,
    content    BLOB NOT NULL,
    sig        BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_replaceable
    ON events(pubkey, kind) WHERE kind BETWEEN 10000 AND 19999;
CREATE UNIQUE INDEX IF NOT EXISTS idx_parameterized
    ON events(pubkey, kind, d_value) WHERE kind BETWEEN 30000 AND 39999;
CREATE INDEX IF NOT EXISTS idx_kind_created ON events(kind, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_created ON events(created_at DESC);
CREATE TABLE IF NOT EXISTS tag_index (
    event_id  BLOB NOT NULL,
    tag_key   TEXT NOT NULL,
    tag_value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tag ON tag_index(tag_key, tag_value);
CREATE INDEX IF NOT EXISTS idx_tag_event ON tag_index(event_id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    ttl_ns: u64,
}

impl SqliteStore {
    pub fn open(path: &Path, ttl_ns: u64) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl_ns,
        })
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
        let event_id: Vec<u8> = row.get(0)?;
        let pubkey: Vec<u8> = row.get(1)?;
        let kind: i64 = row.get(2)?;
        let created_at: i64 = row.get(3)?;
        let tags_blob: Vec<u8> = row.get(4)?;
        let content: Vec<u8> = row.get(5)?;
        let sig: Vec<u8> = row.get(6)?;

        let decode = |name: &str| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Blob,
                format!("corrupt {name} column").into(),
            )
        };
        let tags: Vec<Tag> = postcard::from_bytes(&tags_blob).map_err(|_| decode("tags_blob"))?;
        Ok(Event {
            pubkey: Pubkey(pubkey.try_into().map_err(|_| decode("pubkey"))?),
            created_at: created_at as u64,
            kind: kind as u16,
            tags,
            content,
            event_id: EventId(event_id.try_into().map_err(|_| decode("event_id"))?),
            sig: Sig(sig.try_into().map_err(|_| decode("sig"))?),
        })
    }

    fn insert_event(tx: &rusqlite::Transaction<'_>, event: &Event) -> Result<(), StoreError> {
        let tags_blob = postcard::to_allocvec(&event.tags)?;
        tx.execute(
            "INSERT INTO events (event_id, pubkey, kind, created_at, d_value, tags_blob, content, sig)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &event.event_id.0[..],
                &event.pubkey.0[..],
                event.kind as i64,
                event.created_at as i64,
                event.d_value(),
                tags_blob,
                &event.content,
                &event.sig.0[..],
            ],
        )?;
        for (key, value) in event.tag_pairs() {
            tx.execute(
                "INSERT INTO tag_index (event_id, tag_key, tag_value) VALUES (?1, ?2, ?3)",
                params![&event.event_id.0[..], key, value],
            )?;
        }
        Ok(())
    }

    fn delete_event(tx: &rusqlite::Transaction<'_>, event_id: &EventId) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM tag_index WHERE event_id = ?1",
            params![&event_id.0[..]],
        )?;
        tx.execute(
            "DELETE FROM events WHERE event_id = ?1",
            params![&event_id.0[..]],
        )?;
        Ok(())
    }
}

const EVENT_COLUMNS: &str = "event_id, pubkey, kind, created_at, tags_blob, content, sig";

impl Store for SqliteStore {
    fn put(&self, event: &Event) -> Result<PutOutcome, StoreError> {
        let class = event
            .class()
            .ok_or(StoreError::UnclassifiedKind(event.kind))?;
        if class == KindClass::Ephemeral {
            return Ok(PutOutcome::Inserted);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM events WHERE event_id = ?1",
                params![&event.event_id.0[..]],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(PutOutcome::Duplicate);
        }

        let incumbent: Option<(Vec<u8>, i64)> = match class {
            KindClass::Replaceable => tx
                .query_row(
                    "SELECT event_id, created_at FROM events WHERE pubkey = ?1 AND kind = ?2",
                    params![&event.pubkey.0[..], event.kind as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            KindClass::ParameterizedReplaceable => tx
                .query_row(
                    "SELECT event_id, created_at FROM events
                     WHERE pubkey = ?1 AND kind = ?2 AND d_value = ?3",
                    params![&event.pubkey.0[..], event.kind as i64, event.d_value()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            _ => None,
        };

        let outcome = match (class, incumbent) {
            (KindClass::Immutable, _) | (_, None) => {
                Self::insert_event(&tx, event)?;
                PutOutcome::Inserted
            }
            (_, Some((old_id_bytes, old_created))) => {
                let old_id = EventId(
                    old_id_bytes
                        .try_into()
                        .map_err(|_| StoreError::Corrupt("event_id width".into()))?,
                );
                // The conflict rule needs only (created_at, id).
                let wins = (event.created_at, &event.event_id.0)
                    > (old_created as u64, &old_id.0);
                if wins {
                    Self::delete_event(&tx, &old_id)?;
                    Self::insert_event(&tx, event)?;
                    PutOutcome::Replaced(old_id)
                } else {
                    PutOutcome::Duplicate
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn get(&self, event_id: &EventId) -> Result<Option<Event>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
                params![&event_id.0[..]],
                Self::row_to_event,
            )
            .optional()?)
    }

    fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        // Integer predicates are inlined; everything re-checks against
        // the filter afterwards, so the SQL is only a pre-narrowing.
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        if let Some(kinds) = &filter.kinds {
            let list: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
            sql.push_str(&format!(" AND kind IN ({})", list.join(",")));
        }
        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND created_at >= {}", since as i64));
        }
        if let Some(until) = filter.until {
            sql.push_str(&format!(" AND created_at <= {}", until as i64));
        }
        sql.push_str(" ORDER BY created_at DESC, event_id DESC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_event)?;

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for row in rows {
            let event = row?;
            if filter.matches(&event) {
                out.push(event);
                if out.len() >= limit {
                    break;
                }
            }
        }
        sort_backfill(&mut out);
        Ok(out)
    }

    fn gc(&self, now_ns: u64) -> Result<usize, StoreError> {
        if self.ttl_ns == 0 {
            return Ok(0);
        }
        let cutoff = now_ns.saturating_sub(self.ttl_ns) as i64;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM tag_index WHERE event_id IN
                 (SELECT event_id FROM events WHERE kind <= 999 AND created_at < ?1)",
            params![cutoff],
        )?;
        let dropped = tx.execute(
            "DELETE FROM events WHERE kind <= 999 AND created_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(dropped)
    }

    fn event_count(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        // wal_checkpoint reports a status row; discard it.
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}
