//! Expiring key-value table used as the durable replaceable-event cache.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use relay_pool::KvStore;

use crate::error::StoreError;
use crate::store::{open_connection, open_memory_connection};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_shared(Arc::new(Mutex::new(open_connection(path)?))))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_shared(Arc::new(Mutex::new(
            open_memory_connection()?,
        ))))
    }

    pub(crate) fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Delete every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now_secs()])?;
        Ok(n)
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> relay_pool::Result<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::from)?;

        match row {
            Some((value, expires_at)) if expires_at > now_secs() => Ok(Some(value)),
            Some(_) => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                    .map_err(StoreError::from)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> relay_pool::Result<()> {
        let expires_at = now_secs().saturating_add(ttl.as_secs() as i64);
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                 SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> relay_pool::Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(StoreError::from)?;
        Ok(())
    }
}
