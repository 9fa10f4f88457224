//! Replaceable event resolver.
//!
//! `resolve` calls are queued per kind. A dispatcher task collects them into
//! batches (up to `batch_capacity` keys or `batch_wait` after the first one,
//! whichever comes first) and each batch runs as one coordinated lookup:
//!
//! 1. keys with a cached version resolve from the key-value store;
//! 2. keys with a recent failure marker resolve as not found;
//! 3. the rest are routed to relays (best scored + kind directory + fallback),
//!    grouped so each relay gets a single filter carrying all its authors;
//! 4. replies are merged with last-write-wins and written through;
//! 5. whatever is still missing gets a failure marker.

use futures_util::future::join_all;
use nostr_sdk::{Event, Filter, Kind, PublicKey, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{subscription_id, Notification};
use crate::error::{Error, Result};
use crate::hints::{extract_hints, Sampler};
use crate::kv::{failure_key, replaceable_key, KvStore};
use crate::registry::RelayRegistry;
use crate::relays::RelaySets;
use crate::store::{EventStore, RelayHint, RelayScores};
use crate::url::normalize_all;

/// Kinds that get a loader up front.
const PRELOADED_KINDS: [u16; 4] = [0, 3, 10000, 10002];

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub batch_capacity: usize,
    pub batch_wait: Duration,
    /// Per-relay deadline of a batch query.
    pub query_timeout: Duration,
    /// Relays each key is sent to, at least.
    pub min_relays: usize,
    /// Scored relays taken per key before directories and fallback.
    pub preferred_relays: usize,
    /// Lifetime of a resolved version in the key-value store.
    pub cache_ttl: Duration,
    /// Lifetime of a failure marker.
    pub failure_ttl: Duration,
    /// Relay observations are recorded for one in this many.
    pub hint_sample_rate: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            batch_capacity: 400,
            batch_wait: Duration::from_millis(400),
            query_timeout: Duration::from_secs(4),
            min_relays: 3,
            preferred_relays: 1,
            cache_ttl: Duration::from_secs(18 * 60 * 60),
            failure_ttl: Duration::from_secs(60 * 60),
            hint_sample_rate: 10,
        }
    }
}

/// Whether `candidate` should replace `current` as the latest version.
/// Newer wins; on equal timestamps the lexicographically smaller id wins.
pub fn supersedes(candidate: &Event, current: &Event) -> bool {
    candidate.created_at > current.created_at
        || (candidate.created_at == current.created_at && candidate.id < current.id)
}

struct Request {
    pubkey: PublicKey,
    reply: oneshot::Sender<Option<Event>>,
}

struct ResolverInner {
    registry: Arc<RelayRegistry>,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn EventStore>,
    scores: Arc<dyn RelayScores>,
    relays: Arc<RelaySets>,
    settings: ResolverSettings,
    sampler: Sampler,
}

pub struct ReplaceableResolver {
    inner: Arc<ResolverInner>,
    loaders: Mutex<HashMap<u16, mpsc::UnboundedSender<Request>>>,
}

impl ReplaceableResolver {
    /// Must be called from within a Tokio runtime: the per-kind dispatchers
    /// are spawned here.
    pub fn new(
        registry: Arc<RelayRegistry>,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn EventStore>,
        scores: Arc<dyn RelayScores>,
        relays: Arc<RelaySets>,
        settings: ResolverSettings,
    ) -> Self {
        let sampler = Sampler::new(settings.hint_sample_rate);
        let resolver = Self {
            inner: Arc::new(ResolverInner {
                registry,
                kv,
                store,
                scores,
                relays,
                settings,
                sampler,
            }),
            loaders: Mutex::new(HashMap::new()),
        };
        for kind in PRELOADED_KINDS {
            resolver.loader(Kind::from(kind));
        }
        resolver
    }

    /// Latest known version of the `(pubkey, kind)` replaceable event.
    pub async fn resolve(
        &self,
        ctx: &CancellationToken,
        pubkey: PublicKey,
        kind: Kind,
    ) -> Result<Event> {
        let (reply, rx) = oneshot::channel();
        self.loader(kind)
            .send(Request { pubkey, reply })
            .map_err(|_| Error::Closed)?;

        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            answer = rx => match answer {
                Ok(Some(event)) => Ok(event),
                Ok(None) => Err(Error::NotFound),
                Err(_) => Err(Error::Closed),
            },
        }
    }

    fn loader(&self, kind: Kind) -> mpsc::UnboundedSender<Request> {
        self.loaders
            .lock()
            .entry(kind.as_u16())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(self.inner.clone().dispatch(kind, rx));
                tx
            })
            .clone()
    }
}

impl ResolverInner {
    async fn dispatch(self: Arc<Self>, kind: Kind, mut queue: mpsc::UnboundedReceiver<Request>) {
        let capacity = self.settings.batch_capacity.max(1);
        while let Some(first) = queue.recv().await {
            let mut batch = vec![first];
            let window = tokio::time::sleep(self.settings.batch_wait);
            tokio::pin!(window);

            while batch.len() < capacity {
                tokio::select! {
                    _ = &mut window => break,
                    next = queue.recv() => match next {
                        Some(request) => batch.push(request),
                        None => break,
                    },
                }
            }

            debug!(kind = kind.as_u16(), keys = batch.len(), "dispatching replaceable batch");
            tokio::spawn(self.clone().run_batch(kind, batch));
        }
    }

    async fn run_batch(self: Arc<Self>, kind: Kind, batch: Vec<Request>) {
        let mut waiters: HashMap<PublicKey, Vec<oneshot::Sender<Option<Event>>>> = HashMap::new();
        let mut keys: Vec<PublicKey> = Vec::new();
        for request in batch {
            let entry = waiters.entry(request.pubkey).or_default();
            if entry.is_empty() {
                keys.push(request.pubkey);
            }
            entry.push(request.reply);
        }

        let mut resolved: HashMap<PublicKey, Option<Event>> = HashMap::new();
        let mut pending: Vec<PublicKey> = Vec::new();
        for pk in keys {
            if let Some(event) = self.cached(kind, &pk) {
                resolved.insert(pk, Some(event));
            } else if self.failed_recently(kind, &pk) {
                resolved.insert(pk, None);
            } else {
                pending.push(pk);
            }
        }

        if !pending.is_empty() {
            let found = self.fetch(kind, &pending).await;
            for pk in pending {
                match found.get(&pk) {
                    Some(event) => {
                        self.write_through(event);
                        resolved.insert(pk, Some(event.clone()));
                    }
                    None => {
                        self.mark_failed(kind, &pk);
                        resolved.insert(pk, None);
                    }
                }
            }
        }

        for (pk, replies) in waiters {
            let answer = resolved.remove(&pk).flatten();
            for reply in replies {
                reply.send(answer.clone()).ok();
            }
        }
    }

    fn cached(&self, kind: Kind, pk: &PublicKey) -> Option<Event> {
        let raw = match self.kv.get(&replaceable_key(kind, pk)) {
            Ok(raw) => raw?,
            Err(e) => {
                debug!("kv read failed: {e}");
                return None;
            }
        };
        match serde_json::from_str::<Event>(&raw) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(pubkey = %pk, "dropping unreadable cached event: {e}");
                None
            }
        }
    }

    fn failed_recently(&self, kind: Kind, pk: &PublicKey) -> bool {
        matches!(self.kv.get(&failure_key(kind, pk)), Ok(Some(_)))
    }

    fn mark_failed(&self, kind: Kind, pk: &PublicKey) {
        if let Err(e) = self
            .kv
            .set_ex(&failure_key(kind, pk), "1", self.settings.failure_ttl)
        {
            debug!("failed to set failure marker: {e}");
        }
    }

    /// Store `event` unless an equal or newer version is already cached.
    fn write_through(&self, event: &Event) {
        if let Some(current) = self.cached(event.kind, &event.pubkey) {
            if !supersedes(event, &current) {
                return;
            }
        }
        match serde_json::to_string(event) {
            Ok(raw) => {
                let key = replaceable_key(event.kind, &event.pubkey);
                if let Err(e) = self.kv.set_ex(&key, &raw, self.settings.cache_ttl) {
                    debug!("kv write failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode event: {e}"),
        }
        if let Err(e) = self.store.cache_event(event) {
            debug!("failed to store event: {e}");
        }
        if self.sampler.sample() {
            for hint in extract_hints(event) {
                self.record(&hint.pubkey, &hint.url, hint.hint, hint.when);
            }
        }
    }

    /// Relays to ask for `pk`, best first.
    fn relays_for(&self, pk: &PublicKey, kind: Kind) -> Vec<String> {
        let scored = self
            .scores
            .top_relays_for(pk, self.settings.preferred_relays)
            .unwrap_or_else(|e| {
                debug!("relay ranking unavailable: {e}");
                Vec::new()
            });
        let mut relays = normalize_all(scored);
        for url in self.relays.directory_for(kind) {
            if !relays.contains(url) {
                relays.push(url.clone());
            }
        }
        self.relays.pad(&mut relays, self.settings.min_relays);

        if kind.as_u16() != 10002 {
            let now = Timestamp::now();
            for url in &relays {
                if !self.relays.is_directory(url) && self.sampler.sample() {
                    self.record(pk, url, RelayHint::Attempted, now);
                }
            }
        }
        relays
    }

    async fn fetch(&self, kind: Kind, pending: &[PublicKey]) -> HashMap<PublicKey, Event> {
        let mut per_relay: BTreeMap<String, Vec<PublicKey>> = BTreeMap::new();
        for pk in pending {
            for url in self.relays_for(pk, kind) {
                per_relay.entry(url).or_default().push(*pk);
            }
        }

        let replies = join_all(
            per_relay
                .into_iter()
                .map(|(url, authors)| self.query_relay(kind, url, authors)),
        )
        .await;

        let mut best: HashMap<PublicKey, Event> = HashMap::new();
        for event in replies.into_iter().flatten() {
            match best.get(&event.pubkey) {
                Some(current) if !supersedes(&event, current) => {}
                _ => {
                    best.insert(event.pubkey, event);
                }
            }
        }
        best
    }

    /// Ask one relay for the latest `kind` of every author in `authors`.
    /// Stops after one reply per author, EOSE or the deadline.
    async fn query_relay(&self, kind: Kind, url: String, authors: Vec<PublicKey>) -> Vec<Event> {
        let Some(conn) = self.registry.ensure(&url).await else {
            return Vec::new();
        };

        let filter = Filter::new().kind(kind).authors(authors.iter().copied());
        let id = subscription_id("repl");
        let mut rx = match conn.subscribe(&id, &[filter]).await {
            Ok(rx) => rx,
            Err(e) => {
                debug!(relay = %url, "replaceable query failed: {e}");
                return Vec::new();
            }
        };

        let expected = authors.len();
        let deadline = tokio::time::sleep(self.settings.query_timeout);
        tokio::pin!(deadline);

        let mut events = Vec::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(Notification::Event(event)) => {
                        if event.kind != kind || !authors.contains(&event.pubkey) {
                            continue;
                        }
                        if kind.as_u16() != 10002
                            && !self.relays.is_directory(&url)
                            && self.sampler.sample()
                        {
                            self.record(&event.pubkey, &url, RelayHint::Fetched, Timestamp::now());
                        }
                        events.push(*event);
                        if events.len() >= expected {
                            break;
                        }
                    }
                    Some(Notification::EndOfStoredEvents)
                    | Some(Notification::Closed(_))
                    | None => break,
                },
            }
        }

        conn.close(&id).await;
        events
    }

    fn record(&self, pk: &PublicKey, url: &str, hint: RelayHint, when: Timestamp) {
        if let Err(e) = self.scores.record_hint(pk, url, hint, when) {
            debug!(relay = %url, "failed to record relay hint: {e}");
        }
    }
}
