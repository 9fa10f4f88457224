//! Transport seam between the pool and a single relay.

use async_trait::async_trait;
use nostr_sdk::{Event, Filter, SubscriptionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

/// Buffer size of each per-subscription sink.
pub const SUBSCRIPTION_BUFFER: usize = 512;

/// What a relay can tell one subscription.
#[derive(Debug, Clone)]
pub enum Notification {
    Event(Box<Event>),
    /// Stored events are done, everything after this is live.
    EndOfStoredEvents,
    /// The relay dropped the subscription.
    Closed(String),
}

/// A live connection to one relay.
///
/// Implementations must be cheap to share: the registry hands out the same
/// `Arc` to every subsystem that talks to this relay.
#[async_trait]
pub trait RelayConnection: Send + Sync + 'static {
    /// Normalized URL of the relay.
    fn url(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Install the sink for `id`. Replaces any previous sink for the same id.
    fn register(&self, id: &SubscriptionId) -> mpsc::Receiver<Notification>;

    /// Send a REQ. Sending again for an open id swaps its filters on the relay,
    /// events keep flowing into the sink installed by [`register`](Self::register).
    async fn req(&self, id: &SubscriptionId, filters: &[Filter]) -> Result<()>;

    /// Send CLOSE and drop the sink.
    async fn close(&self, id: &SubscriptionId);

    /// Send an event and wait for the relay's `OK`.
    async fn publish(&self, event: &Event) -> Result<()>;

    async fn subscribe(
        &self,
        id: &SubscriptionId,
        filters: &[Filter],
    ) -> Result<mpsc::Receiver<Notification>> {
        let rx = self.register(id);
        if let Err(e) = self.req(id, filters).await {
            self.close(id).await;
            return Err(e);
        }
        Ok(rx)
    }
}

/// Opens connections. The registry is the only caller.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayConnection>>;
}

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique subscription id with a readable label (`feed:12`).
pub fn subscription_id(label: &str) -> SubscriptionId {
    let n = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
    SubscriptionId::new(format!("{label}:{n}"))
}
