//! Home feed multiplexer.
//!
//! Many listeners, each interested in a set of authors, share one standing
//! subscription per relay. Every subscription holds one filter per author;
//! edits go into a staged copy that replaces the live set the next time the
//! subscription is fired, so a burst of joins costs one REQ per relay.
//!
//! All bookkeeping sits behind a single lock that is never held across
//! network I/O:
//!
//! ```text
//! add_listener:  lock: register + claim new authors
//!                ----: pick relays, connect
//!                lock: stage filters, create subscriptions
//!                ----: fire (REQ), spawn consumers
//! cancel:        lock: drop listener, unstage orphaned authors
//!                ----: CLOSE empty subscriptions, fire the rest
//! ```

use futures_util::future::join_all;
use nostr_sdk::{Event, Filter, Kind, PublicKey, SubscriptionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{subscription_id, Notification, RelayConnection};
use crate::pool::record_seen;
use crate::registry::RelayRegistry;
use crate::relays::RelaySets;
use crate::store::{EventStore, RelayScores};
use crate::unique::DEFAULT_WINDOW;
use crate::url::normalize_all;

const LISTENER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Scored relays picked per author.
    pub relays_per_author: usize,
    /// Fallback relays pad the pick up to this many.
    pub min_relays: usize,
    /// `limit` of each author filter.
    pub initial_backlog: usize,
    /// Trailing window of duplicate suppression on listener streams.
    pub dedup_window: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            relays_per_author: 3,
            min_relays: 2,
            initial_backlog: 100,
            dedup_window: DEFAULT_WINDOW,
        }
    }
}

type ListenerId = u64;

/// Relays currently serving one author.
struct Route {
    /// Listener that routed this author; guards against a concurrent re-route.
    claim: ListenerId,
    relays: Vec<String>,
}

struct RelaySubscription {
    id: SubscriptionId,
    conn: Arc<dyn RelayConnection>,
    live: BTreeMap<PublicKey, Filter>,
    staged: Option<BTreeMap<PublicKey, Filter>>,
    consumer: CancellationToken,
    /// Serializes fires so the last REQ sent carries the newest set.
    fire: Arc<tokio::sync::Mutex<()>>,
}

impl RelaySubscription {
    fn next_mut(&mut self) -> &mut BTreeMap<PublicKey, Filter> {
        if self.staged.is_none() {
            self.staged = Some(self.live.clone());
        }
        self.staged.get_or_insert_with(BTreeMap::new)
    }

    fn effective(&self) -> &BTreeMap<PublicKey, Filter> {
        self.staged.as_ref().unwrap_or(&self.live)
    }
}

#[derive(Default)]
struct FeedState {
    next_listener: ListenerId,
    listeners: HashMap<PublicKey, Vec<(ListenerId, mpsc::Sender<Event>)>>,
    routes: HashMap<PublicKey, Route>,
    subscriptions: HashMap<String, RelaySubscription>,
}

/// Snapshot of the multiplexer bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Authors each relay subscription is (about to be) filtering on.
    pub relays: BTreeMap<String, BTreeSet<PublicKey>>,
    /// Live listener count per author.
    pub listeners: BTreeMap<PublicKey, usize>,
    /// Authors with an active route.
    pub routed: BTreeSet<PublicKey>,
}

impl FeedSummary {
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty() && self.listeners.is_empty() && self.routed.is_empty()
    }
}

struct NewConsumer {
    url: String,
    id: SubscriptionId,
    events: mpsc::Receiver<Notification>,
    token: CancellationToken,
}

struct FeedInner {
    registry: Arc<RelayRegistry>,
    store: Arc<dyn EventStore>,
    scores: Arc<dyn RelayScores>,
    relays: Arc<RelaySets>,
    settings: FeedSettings,
    state: Mutex<FeedState>,
}

#[derive(Clone)]
pub struct HomeFeed {
    inner: Arc<FeedInner>,
}

impl HomeFeed {
    pub fn new(
        registry: Arc<RelayRegistry>,
        store: Arc<dyn EventStore>,
        scores: Arc<dyn RelayScores>,
        relays: Arc<RelaySets>,
        settings: FeedSettings,
    ) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                registry,
                store,
                scores,
                relays,
                settings,
                state: Mutex::new(FeedState::default()),
            }),
        }
    }

    /// Stream notes from `pubkeys` until `ctx` is cancelled.
    ///
    /// Delivery is at-least-once: the same event may arrive from several
    /// relays and in any order.
    pub async fn add_listener(
        &self,
        ctx: &CancellationToken,
        pubkeys: &[PublicKey],
    ) -> ReceiverStream<Event> {
        let inner = &self.inner;
        let pubkeys: Vec<PublicKey> = pubkeys
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);

        let (listener, fresh) = {
            let mut state = inner.state.lock();
            state.next_listener += 1;
            let listener = state.next_listener;
            let mut fresh = Vec::new();
            for pk in &pubkeys {
                state
                    .listeners
                    .entry(*pk)
                    .or_default()
                    .push((listener, tx.clone()));
                if !state.routes.contains_key(pk) {
                    state.routes.insert(
                        *pk,
                        Route {
                            claim: listener,
                            relays: Vec::new(),
                        },
                    );
                    fresh.push(*pk);
                }
            }
            (listener, fresh)
        };
        drop(tx);

        let plans: Vec<(PublicKey, Vec<String>, Filter)> =
            fresh.iter().map(|pk| inner.plan(pk)).collect();

        let mut urls: Vec<String> = plans.iter().flat_map(|(_, r, _)| r.clone()).collect();
        urls.sort();
        urls.dedup();
        let conns: HashMap<String, Arc<dyn RelayConnection>> =
            join_all(urls.iter().map(|url| inner.registry.ensure(url)))
                .await
                .into_iter()
                .zip(urls)
                .filter_map(|(conn, url)| conn.map(|c| (url, c)))
                .collect();

        let mut to_fire: BTreeSet<String> = BTreeSet::new();
        let mut consumers: Vec<NewConsumer> = Vec::new();
        {
            let mut state = inner.state.lock();
            for (pk, relays, filter) in plans {
                if state.routes.get(&pk).map(|r| r.claim) != Some(listener) {
                    continue;
                }
                let mut served = Vec::new();
                for url in relays {
                    let Some(conn) = conns.get(&url) else {
                        continue;
                    };
                    match state.subscriptions.get_mut(&url) {
                        Some(sub) => {
                            sub.next_mut().insert(pk, filter.clone());
                        }
                        None => {
                            let id = subscription_id("feed");
                            let token = CancellationToken::new();
                            consumers.push(NewConsumer {
                                url: url.clone(),
                                id: id.clone(),
                                events: conn.register(&id),
                                token: token.clone(),
                            });
                            state.subscriptions.insert(
                                url.clone(),
                                RelaySubscription {
                                    id,
                                    conn: conn.clone(),
                                    live: BTreeMap::new(),
                                    staged: Some(BTreeMap::from([(pk, filter.clone())])),
                                    consumer: token,
                                    fire: Arc::default(),
                                },
                            );
                        }
                    }
                    to_fire.insert(url.clone());
                    served.push(url);
                }
                if served.is_empty() {
                    warn!(pubkey = %pk, "no reachable relay for author");
                    state.routes.remove(&pk);
                } else if let Some(route) = state.routes.get_mut(&pk) {
                    route.relays = served;
                }
            }
        }

        for url in &to_fire {
            inner.fire(url).await;
        }
        for consumer in consumers {
            tokio::spawn(inner.clone().consume(consumer));
        }

        {
            let inner = inner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.cancelled().await;
                inner.remove_listener(listener, &pubkeys).await;
            });
        }

        ReceiverStream::new(rx)
    }

    pub fn summary(&self) -> FeedSummary {
        let state = self.inner.state.lock();
        FeedSummary {
            relays: state
                .subscriptions
                .iter()
                .map(|(url, sub)| (url.clone(), sub.effective().keys().copied().collect()))
                .collect(),
            listeners: state
                .listeners
                .iter()
                .map(|(pk, list)| (*pk, list.len()))
                .collect(),
            routed: state.routes.keys().copied().collect(),
        }
    }
}

impl FeedInner {
    /// Relays and filter for an author that nobody routes yet.
    fn plan(&self, pk: &PublicKey) -> (PublicKey, Vec<String>, Filter) {
        let scored = self
            .scores
            .top_relays_for(pk, self.settings.relays_per_author)
            .unwrap_or_else(|e| {
                debug!(pubkey = %pk, "relay ranking unavailable: {e}");
                Vec::new()
            });
        let mut relays = normalize_all(scored);
        self.relays.pad(&mut relays, self.settings.min_relays);

        let mut filter = Filter::new()
            .kind(Kind::TextNote)
            .author(*pk)
            .limit(self.settings.initial_backlog);
        match self.store.latest_timestamp_for_author(pk) {
            Ok(Some(since)) => filter = filter.since(since),
            Ok(None) => {}
            Err(e) => debug!(pubkey = %pk, "latest timestamp unavailable: {e}"),
        }
        (*pk, relays, filter)
    }

    /// Promote the staged set of the subscription on `url` and send it.
    async fn fire(&self, url: &str) {
        let Some(lock) = self.state.lock().subscriptions.get(url).map(|s| s.fire.clone()) else {
            return;
        };
        let _guard = lock.lock().await;

        let (conn, id, filters) = {
            let mut state = self.state.lock();
            let Some(sub) = state.subscriptions.get_mut(url) else {
                return;
            };
            if !Arc::ptr_eq(&sub.fire, &lock) {
                return;
            }
            let Some(staged) = sub.staged.take() else {
                return;
            };
            sub.live = staged;
            let filters: Vec<Filter> = sub.live.values().cloned().collect();
            (sub.conn.clone(), sub.id.clone(), filters)
        };
        if filters.is_empty() {
            return;
        }

        debug!(relay = %url, authors = filters.len(), "firing feed subscription");
        if let Err(e) = conn.req(&id, &filters).await {
            warn!(relay = %url, "feed REQ failed: {e}");
        }
    }

    async fn consume(self: Arc<Self>, consumer: NewConsumer) {
        let NewConsumer {
            url,
            id,
            mut events,
            token,
        } = consumer;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = events.recv() => match next {
                    Some(Notification::Event(event)) => {
                        if let Err(e) = self.store.cache_event(&event) {
                            debug!("failed to cache event: {e}");
                        }
                        record_seen(self.scores.as_ref(), &url, &event);

                        let sinks: Vec<mpsc::Sender<Event>> = self
                            .state
                            .lock()
                            .listeners
                            .get(&event.pubkey)
                            .map(|list| list.iter().map(|(_, tx)| tx.clone()).collect())
                            .unwrap_or_default();
                        for sink in sinks {
                            sink.send((*event).clone()).await.ok();
                        }
                    }
                    Some(Notification::EndOfStoredEvents) => {
                        debug!(relay = %url, "feed backlog complete");
                    }
                    Some(Notification::Closed(reason)) => {
                        warn!(relay = %url, "feed subscription closed: {reason}");
                        break;
                    }
                    None => {
                        debug!(relay = %url, "feed subscription ended");
                        break;
                    }
                },
            }
        }

        if !token.is_cancelled() {
            self.forget(&url, &id);
        }
    }

    /// Drop a subscription that died under us. Its authors lose the route so
    /// the next listener re-selects relays for them.
    fn forget(&self, url: &str, id: &SubscriptionId) {
        let mut state = self.state.lock();
        if state.subscriptions.get(url).map(|s| &s.id) != Some(id) {
            return;
        }
        let Some(sub) = state.subscriptions.remove(url) else {
            return;
        };
        let authors: BTreeSet<PublicKey> = sub
            .live
            .keys()
            .chain(sub.staged.iter().flat_map(|s| s.keys()))
            .copied()
            .collect();
        for pk in authors {
            let orphaned = match state.routes.get_mut(&pk) {
                Some(route) => {
                    route.relays.retain(|u| u != url);
                    route.relays.is_empty()
                }
                None => false,
            };
            if orphaned {
                state.routes.remove(&pk);
            }
        }
    }

    async fn remove_listener(&self, listener: ListenerId, pubkeys: &[PublicKey]) {
        let mut closing: Vec<RelaySubscription> = Vec::new();
        let mut refire: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut orphaned = Vec::new();
            for pk in pubkeys {
                let Some(list) = state.listeners.get_mut(pk) else {
                    continue;
                };
                list.retain(|(id, _)| *id != listener);
                if list.is_empty() {
                    state.listeners.remove(pk);
                    orphaned.push(*pk);
                }
            }

            let mut touched = BTreeSet::new();
            for pk in orphaned {
                let Some(route) = state.routes.remove(&pk) else {
                    continue;
                };
                for url in route.relays {
                    if let Some(sub) = state.subscriptions.get_mut(&url) {
                        sub.next_mut().remove(&pk);
                        touched.insert(url);
                    }
                }
            }

            for url in touched {
                let empty = state
                    .subscriptions
                    .get(&url)
                    .is_some_and(|sub| sub.effective().is_empty());
                if empty {
                    if let Some(sub) = state.subscriptions.remove(&url) {
                        closing.push(sub);
                    }
                } else {
                    refire.push(url);
                }
            }
        }

        for sub in closing {
            debug!(relay = %sub.conn.url(), "tearing down feed subscription");
            sub.consumer.cancel();
            sub.conn.close(&sub.id).await;
        }
        for url in refire {
            self.fire(&url).await;
        }
    }
}
