//! Connection registry: one live connection per relay URL.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::connection::{Connector, RelayConnection};
use crate::error::Error;
use crate::url::normalize_url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Slot = Arc<OnceCell<Arc<dyn RelayConnection>>>;

pub struct RelayRegistry {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl RelayRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_timeout(connector, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live connection for `url`, connecting if needed.
    ///
    /// Concurrent callers for the same URL share a single connect attempt.
    /// A failed attempt leaves nothing behind, so the next call tries again.
    pub async fn ensure(&self, url: &str) -> Option<Arc<dyn RelayConnection>> {
        let url = normalize_url(url)?;

        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(url.clone()).or_default();
            if slot.get().is_some_and(|conn| !conn.is_connected()) {
                debug!(relay = %url, "dropping dead connection");
                *slot = Slot::default();
            }
            slot.clone()
        };

        let result = slot
            .get_or_try_init(|| async {
                match tokio::time::timeout(self.connect_timeout, self.connector.connect(&url)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                }
            })
            .await;

        match result {
            Ok(conn) => Some(conn.clone()),
            Err(e) => {
                warn!(relay = %url, "failed to connect: {e}");
                let mut slots = self.slots.lock();
                if slots
                    .get(&url)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none())
                {
                    slots.remove(&url);
                }
                None
            }
        }
    }

    /// URLs with a connection that is currently up.
    pub fn connected(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|conn| conn.is_connected()))
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }
}

#[cfg(test)]
impl RelayRegistry {
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}
