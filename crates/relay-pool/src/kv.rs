//! Local key-value store for resolved replaceable events and failure markers.

use nostr_sdk::{Kind, PublicKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;

/// Fast local store with per-key expiry. Callers treat any error as a miss.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Key under which the latest resolved version of `(kind, pubkey)` lives.
pub fn replaceable_key(kind: Kind, pubkey: &PublicKey) -> String {
    format!("rpl:{}:{}", kind.as_u16(), pubkey.to_hex())
}

/// Marker key for a recent failed resolution of `(kind, pubkey)`.
pub fn failure_key(kind: Kind, pubkey: &PublicKey) -> String {
    format!("fail:{}:{}", kind.as_u16(), pubkey.to_hex())
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
