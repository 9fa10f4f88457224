//! One-shot network operations over the registry.

use nostr_sdk::{Event, EventId, Filter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::Caches;
use crate::connection::{subscription_id, Notification};
use crate::error::{Error, Result};
use crate::race::{race, race_within};
use crate::registry::RelayRegistry;
use crate::relays::RelaySets;
use crate::store::{seen_score, EventStore, RelayScores};
use crate::url::normalize_all;

/// Default deadlines for operations whose caller does not bring one.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub connect: Duration,
    pub publish: Duration,
    /// Generic `query_sync` deadline.
    pub query: Duration,
    /// Per-relay deadline of single-event and replaceable lookups.
    pub lookup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            publish: Duration::from_secs(3),
            query: Duration::from_secs(5),
            lookup: Duration::from_secs(4),
        }
    }
}

/// Relays a single-event lookup wants before giving up on hints alone.
const MIN_LOOKUP_RELAYS: usize = 3;

#[derive(Clone)]
pub struct RelayPool {
    registry: Arc<RelayRegistry>,
    store: Arc<dyn EventStore>,
    scores: Arc<dyn RelayScores>,
    caches: Arc<Caches>,
    relays: Arc<RelaySets>,
    timeouts: Timeouts,
}

impl RelayPool {
    pub fn new(
        registry: Arc<RelayRegistry>,
        store: Arc<dyn EventStore>,
        scores: Arc<dyn RelayScores>,
        caches: Arc<Caches>,
        relays: Arc<RelaySets>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            registry,
            store,
            scores,
            caches,
            relays,
            timeouts,
        }
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Collect stored events from one relay until EOSE, the deadline or
    /// cancellation. An unreachable relay yields nothing.
    pub async fn query_sync(
        &self,
        ctx: &CancellationToken,
        url: &str,
        filters: Vec<Filter>,
        timeout: Option<Duration>,
    ) -> Vec<Event> {
        let Some(conn) = self.registry.ensure(url).await else {
            return Vec::new();
        };

        let id = subscription_id("query");
        let mut rx = match conn.subscribe(&id, &filters).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(relay = %conn.url(), "query failed: {e}");
                return Vec::new();
            }
        };

        let deadline = tokio::time::sleep(timeout.unwrap_or(self.timeouts.query));
        tokio::pin!(deadline);

        let mut events = Vec::new();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = &mut deadline => {
                    debug!(relay = %conn.url(), "query timed out with {} event(s)", events.len());
                    break;
                }
                next = rx.recv() => match next {
                    Some(Notification::Event(event)) => {
                        record_seen(self.scores.as_ref(), conn.url(), &event);
                        events.push(*event);
                    }
                    Some(Notification::EndOfStoredEvents) | None => break,
                    Some(Notification::Closed(reason)) => {
                        debug!(relay = %conn.url(), "query closed: {reason}");
                        break;
                    }
                },
            }
        }

        conn.close(&id).await;
        events
    }

    /// Subscribe to `filters` on every relay in `urls` and merge the results.
    /// Events are deduplicated by id, persisted and credited to the relay that
    /// delivered them first. The stream ends once `ctx` is cancelled.
    pub fn sub_many(
        &self,
        ctx: &CancellationToken,
        urls: &[String],
        filters: Vec<Filter>,
    ) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(256);
        let seen: Arc<Mutex<HashSet<EventId>>> = Arc::default();

        for url in normalize_all(urls) {
            let pool = self.clone();
            let ctx = ctx.clone();
            let filters = filters.clone();
            let seen = seen.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(conn) = pool.registry.ensure(&url).await else {
                    return;
                };
                let id = subscription_id("many");
                let mut events = match conn.subscribe(&id, &filters).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!(relay = %url, "subscription failed: {e}");
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        next = events.recv() => match next {
                            Some(Notification::Event(event)) => {
                                if !seen.lock().insert(event.id) {
                                    continue;
                                }
                                if let Err(e) = pool.store.cache_event(&event) {
                                    debug!("failed to cache event: {e}");
                                }
                                record_seen(pool.scores.as_ref(), &url, &event);
                                if tx.send(*event).await.is_err() {
                                    break;
                                }
                            }
                            Some(Notification::EndOfStoredEvents) => {}
                            Some(Notification::Closed(_)) | None => break,
                        },
                    }
                }
                conn.close(&id).await;
            });
        }

        ReceiverStream::new(rx)
    }

    /// Send `event` to every target and return the first relay that accepts
    /// it. Attempts still in flight keep going in the background until the
    /// publish deadline or `ctx` ends them.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        targets: &[String],
    ) -> Result<String> {
        let deadline = self.timeouts.publish;
        let result = race_within(ctx, deadline, normalize_all(targets), |url, token| {
            let registry = self.registry.clone();
            let event = event.clone();
            let ctx = ctx.clone();
            let attempt = tokio::spawn(async move {
                let send = async {
                    let conn = registry
                        .ensure(&url)
                        .await
                        .ok_or_else(|| Error::connection(&url, "unavailable"))?;
                    conn.publish(&event).await?;
                    Ok::<_, Error>(url.clone())
                };
                tokio::select! {
                    _ = ctx.cancelled() => Err(Error::Cancelled),
                    r = tokio::time::timeout(deadline, send) => r.unwrap_or(Err(Error::Timeout)),
                }
            });
            async move {
                tokio::select! {
                    _ = token.cancelled() => Err(Error::Cancelled),
                    joined = attempt => joined.unwrap_or(Err(Error::Closed)),
                }
            }
        })
        .await;

        match &result {
            Ok(url) => debug!(relay = %url, id = %event.id, "event published"),
            Err(e) => warn!(id = %event.id, "publish failed: {e}"),
        }
        result.map_err(|e| match e {
            Error::Timeout => Error::AllTargetsFailed {
                attempted: targets.len(),
            },
            other => other,
        })
    }

    /// Look up a single event: memory cache, local store, then the hinted
    /// relays padded with fallback ones. Both hits and misses are cached.
    pub async fn fetch_event(
        &self,
        ctx: &CancellationToken,
        id: &EventId,
        hints: &[String],
    ) -> Option<Event> {
        let key = id.to_hex();
        if let Some(cached) = self.caches.events.get(&key) {
            return cached;
        }

        let filter = Filter::new().id(*id).limit(1);
        match self.store.query_events(&filter) {
            Ok(found) => {
                if let Some(event) = found.into_iter().next() {
                    self.caches
                        .remember(&self.caches.events, &key, Some(event.clone()));
                    return Some(event);
                }
            }
            Err(e) => debug!("local lookup failed: {e}"),
        }

        let mut relays = normalize_all(hints);
        self.relays.pad(&mut relays, MIN_LOOKUP_RELAYS);

        let timeout = self.timeouts.lookup;
        let found = race(ctx, relays, |url, token| {
            let filter = filter.clone();
            async move {
                let events = self.query_sync(&token, &url, vec![filter], Some(timeout)).await;
                events.into_iter().find(|e| e.id == *id).ok_or(Error::NotFound)
            }
        })
        .await;

        match found {
            Ok(event) => {
                if let Err(e) = self.store.cache_event(&event) {
                    debug!("failed to store event: {e}");
                }
                self.caches
                    .remember(&self.caches.events, &key, Some(event.clone()));
                Some(event)
            }
            Err(Error::Cancelled) => None,
            Err(e) => {
                debug!(id = %key, "event not found: {e}");
                self.caches.remember(&self.caches.events, &key, None);
                None
            }
        }
    }
}

/// Credit `url` for delivering `event`.
pub(crate) fn record_seen(scores: &dyn RelayScores, url: &str, event: &Event) {
    if let Err(e) = scores.increment_score(&event.pubkey, url, seen_score(event.created_at)) {
        debug!(relay = %url, "failed to update relay score: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relays::RelayLists;
    use crate::testing::{signed, MemoryStore, MockConnector};
    use futures_util::StreamExt;
    use nostr_sdk::{Keys, Kind};

    fn pool_with(fallback: &[&str]) -> (RelayPool, Arc<MockConnector>, Arc<MemoryStore>) {
        let connector = Arc::new(MockConnector::new());
        let store = Arc::new(MemoryStore::new());
        let relays = RelaySets::new(&RelayLists {
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
            ..RelayLists::default()
        });
        let pool = RelayPool::new(
            Arc::new(RelayRegistry::new(connector.clone())),
            store.clone(),
            store.clone(),
            Arc::new(Caches::default()),
            Arc::new(relays),
            Timeouts::default(),
        );
        (pool, connector, store)
    }

    #[tokio::test]
    async fn query_sync_stops_at_eose_and_scores() {
        let (pool, connector, store) = pool_with(&[]);
        let keys = Keys::generate();
        connector
            .relay("wss://r1.example")
            .store(signed(&keys, Kind::TextNote, "a", 100, &[]));

        let ctx = CancellationToken::new();
        let filter = Filter::new().author(keys.public_key());
        let events = pool.query_sync(&ctx, "wss://r1.example", vec![filter], None).await;

        assert_eq!(events.len(), 1);
        assert!(store.score_of(&keys.public_key(), "wss://r1.example") > 0.0);
        assert!(connector.relay("wss://r1.example").open_subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn query_sync_gives_up_on_silent_relays() {
        let (pool, connector, _) = pool_with(&[]);
        connector.relay("wss://mute.example").go_silent();

        let ctx = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let events = pool
            .query_sync(
                &ctx,
                "wss://mute.example",
                vec![Filter::new()],
                Some(Duration::from_millis(300)),
            )
            .await;

        assert!(events.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(connector.relay("wss://mute.example").closes().len(), 1);
    }

    #[tokio::test]
    async fn publish_succeeds_when_any_target_accepts() {
        let (pool, connector, _) = pool_with(&[]);
        connector.relay("wss://bad.example").reject_publishes("blocked");
        connector.fail("wss://down.example");

        let event = signed(&Keys::generate(), Kind::TextNote, "hi", 1, &[]);
        let targets = vec![
            "wss://bad.example".to_string(),
            "wss://down.example".to_string(),
            "wss://good.example".to_string(),
        ];
        let ctx = CancellationToken::new();

        let winner = pool.publish(&ctx, &event, &targets).await.unwrap();
        assert_eq!(winner, "wss://good.example");
        assert_eq!(connector.relay("wss://good.example").published().len(), 1);
    }

    #[tokio::test]
    async fn publish_fails_when_nobody_accepts() {
        let (pool, connector, _) = pool_with(&[]);
        connector.relay("wss://bad.example").reject_publishes("blocked");
        connector.fail("wss://down.example");

        let event = signed(&Keys::generate(), Kind::TextNote, "hi", 1, &[]);
        let targets = vec!["wss://bad.example".to_string(), "wss://down.example".to_string()];
        let ctx = CancellationToken::new();

        assert_eq!(
            pool.publish(&ctx, &event, &targets).await,
            Err(Error::AllTargetsFailed { attempted: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slower_targets_still_receive_the_event() {
        let (pool, connector, _) = pool_with(&[]);
        connector
            .relay("wss://slow.example")
            .delay_publishes(Duration::from_millis(500));

        let event = signed(&Keys::generate(), Kind::TextNote, "hi", 1, &[]);
        let targets = vec!["wss://fast.example".to_string(), "wss://slow.example".to_string()];
        let ctx = CancellationToken::new();

        assert_eq!(
            pool.publish(&ctx, &event, &targets).await.unwrap(),
            "wss://fast.example"
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.relay("wss://slow.example").published().len(), 1);
    }

    #[tokio::test]
    async fn fetch_event_uses_hints_and_caches_misses() {
        let (pool, connector, store) = pool_with(&["wss://f1.example", "wss://f2.example"]);
        let keys = Keys::generate();
        let event = signed(&keys, Kind::TextNote, "needle", 10, &[]);
        connector.relay("wss://hint.example").store(event.clone());

        let ctx = CancellationToken::new();
        let got = pool
            .fetch_event(&ctx, &event.id, &["wss://hint.example".to_string()])
            .await;
        assert_eq!(got.map(|e| e.id), Some(event.id));
        assert_eq!(store.event_count(), 1);

        let missing = signed(&keys, Kind::TextNote, "nowhere", 11, &[]).id;
        assert!(pool.fetch_event(&ctx, &missing, &[]).await.is_none());
        let asked = connector.relay("wss://f1.example").reqs().len();
        assert!(pool.fetch_event(&ctx, &missing, &[]).await.is_none());
        assert_eq!(connector.relay("wss://f1.example").reqs().len(), asked);
    }

    #[tokio::test]
    async fn sub_many_dedups_across_relays() {
        let (pool, connector, store) = pool_with(&[]);
        let keys = Keys::generate();
        let event = signed(&keys, Kind::TextNote, "twice", 10, &[]);
        connector.relay("wss://a.example").store(event.clone());
        connector.relay("wss://b.example").store(event.clone());

        let ctx = CancellationToken::new();
        let urls = vec!["wss://a.example".to_string(), "wss://b.example".to_string()];
        let mut stream = pool.sub_many(&ctx, &urls, vec![Filter::new().author(keys.public_key())]);

        assert_eq!(stream.next().await.map(|e| e.id), Some(event.id));
        ctx.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(store.event_count(), 1);
    }
}
