//! In-memory stand-ins for relays and stores.
//!
//! `MockConnector` hands out scripted `MockRelay`s that answer REQs from a
//! list of stored events, record every frame they receive and let tests push
//! live events. `MemoryStore` implements both persisted collaborators.

use async_trait::async_trait;
use nostr_sdk::{Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, SubscriptionId, Tag, TagKind, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::connection::{Connector, Notification, RelayConnection, SUBSCRIPTION_BUFFER};
use crate::error::{Error, Result};
use crate::store::{filter_matches, hint_score, EventStore, RelayHint, RelayScores};

pub use crate::kv::MemoryKv;

/// Sign an event with a fixed timestamp and raw tags.
pub fn signed(keys: &Keys, kind: Kind, content: &str, created_at: u64, tags: &[&[&str]]) -> Event {
    let tags: Vec<Tag> = tags
        .iter()
        .map(|t| {
            Tag::custom(
                TagKind::custom(t[0]),
                t[1..].iter().map(|s| s.to_string()).collect::<Vec<String>>(),
            )
        })
        .collect();
    EventBuilder::new(kind, content)
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .expect("signing with local keys")
}

/// Poll `check` until it holds, panicking after about a second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Union of the `authors` of every filter.
pub fn authors_of(filters: &[Filter]) -> BTreeSet<PublicKey> {
    filters
        .iter()
        .filter_map(|f| f.authors.as_ref())
        .flat_map(|a| a.iter().copied())
        .collect()
}

#[derive(Default)]
struct MockState {
    stored: Vec<Event>,
    sinks: HashMap<String, mpsc::Sender<Notification>>,
    live: HashMap<String, Vec<Filter>>,
    reqs: Vec<(String, Vec<Filter>)>,
    closes: Vec<String>,
    published: Vec<Event>,
    reject: Option<String>,
    publish_delay: Duration,
    silent: bool,
}

pub struct MockRelay {
    url: String,
    connected: AtomicBool,
    state: Mutex<MockState>,
}

impl MockRelay {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            connected: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Store an event and deliver it to every open subscription it matches.
    pub fn push(&self, event: Event) {
        let mut state = self.state.lock();
        for (id, filters) in &state.live {
            if filters.iter().any(|f| filter_matches(f, &event)) {
                if let Some(sink) = state.sinks.get(id) {
                    sink.try_send(Notification::Event(Box::new(event.clone()))).ok();
                }
            }
        }
        state.stored.push(event);
    }

    /// Store an event without delivering it to open subscriptions.
    pub fn store(&self, event: Event) {
        self.state.lock().stored.push(event);
    }

    /// Stop answering REQs with stored events and EOSE.
    pub fn go_silent(&self) {
        self.state.lock().silent = true;
    }

    pub fn reject_publishes(&self, reason: &str) {
        self.state.lock().reject = Some(reason.to_string());
    }

    pub fn delay_publishes(&self, delay: Duration) {
        self.state.lock().publish_delay = delay;
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.sinks.clear();
        state.live.clear();
    }

    /// Every REQ received, in order.
    pub fn reqs(&self) -> Vec<(String, Vec<Filter>)> {
        self.state.lock().reqs.clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.state.lock().closes.clone()
    }

    pub fn published(&self) -> Vec<Event> {
        self.state.lock().published.clone()
    }

    /// Subscriptions that are open right now, with their latest filters.
    pub fn open_subscriptions(&self) -> Vec<(String, Vec<Filter>)> {
        let state = self.state.lock();
        let mut subs: Vec<_> = state
            .live
            .iter()
            .map(|(id, filters)| (id.clone(), filters.clone()))
            .collect();
        subs.sort_by(|a, b| a.0.cmp(&b.0));
        subs
    }

    fn stored_events(&self) -> Vec<Event> {
        self.state.lock().stored.clone()
    }

    fn replay(stored: &[Event], filters: &[Filter]) -> Vec<Event> {
        let mut out: Vec<Event> = Vec::new();
        for filter in filters {
            let mut matched: Vec<&Event> =
                stored.iter().filter(|e| filter_matches(filter, e)).collect();
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matched.truncate(limit);
            }
            for event in matched {
                if !out.iter().any(|e| e.id == event.id) {
                    out.push(event.clone());
                }
            }
        }
        out
    }
}

#[async_trait]
impl RelayConnection for MockRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn register(&self, id: &SubscriptionId) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.state.lock().sinks.insert(id.to_string(), tx);
        rx
    }

    async fn req(&self, id: &SubscriptionId, filters: &[Filter]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection(&self.url, "not connected"));
        }
        let key = id.to_string();
        let (sink, backlog, silent) = {
            let mut state = self.state.lock();
            state.reqs.push((key.clone(), filters.to_vec()));
            state.live.insert(key.clone(), filters.to_vec());
            let backlog = Self::replay(&state.stored, filters);
            (state.sinks.get(&key).cloned(), backlog, state.silent)
        };
        if silent {
            return Ok(());
        }
        if let Some(sink) = sink {
            for event in backlog {
                sink.send(Notification::Event(Box::new(event))).await.ok();
            }
            sink.send(Notification::EndOfStoredEvents).await.ok();
        }
        Ok(())
    }

    async fn close(&self, id: &SubscriptionId) {
        let key = id.to_string();
        let mut state = self.state.lock();
        state.sinks.remove(&key);
        state.live.remove(&key);
        state.closes.push(key);
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection(&self.url, "not connected"));
        }
        let delay = self.state.lock().publish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(reason) = &state.reject {
            return Err(Error::Rejected {
                url: self.url.clone(),
                reason: reason.clone(),
            });
        }
        state.published.push(event.clone());
        Ok(())
    }
}

/// Connector over a set of [`MockRelay`]s keyed by normalized URL.
#[derive(Default)]
pub struct MockConnector {
    relays: Mutex<HashMap<String, Arc<MockRelay>>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current relay behind `url`, created on first use.
    pub fn relay(&self, url: &str) -> Arc<MockRelay> {
        self.relays
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MockRelay::new(url)))
            .clone()
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().remove(url);
        self.hanging.lock().remove(url);
    }

    /// Make connects to `url` never finish.
    pub fn hang(&self, url: &str) {
        self.hanging.lock().insert(url.to_string());
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.connects.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayConnection>> {
        *self.connects.lock().entry(url.to_string()).or_default() += 1;

        if self.hanging.lock().contains(url) {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().contains(url) {
            return Err(Error::connection(url, "refused"));
        }

        let mut relays = self.relays.lock();
        let relay = relays
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MockRelay::new(url)));
        if !relay.is_connected() {
            let fresh = MockRelay::new(url);
            fresh.state.lock().stored = relay.stored_events();
            *relay = Arc::new(fresh);
        }
        Ok(relay.clone())
    }
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<EventId, Event>,
    follows: HashMap<PublicKey, BTreeSet<PublicKey>>,
    scores: HashMap<(PublicKey, String), f64>,
    hints: HashMap<(PublicKey, String, RelayHint), Timestamp>,
}

/// In-memory [`EventStore`] and [`RelayScores`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score_of(&self, pubkey: &PublicKey, url: &str) -> f64 {
        self.state
            .lock()
            .scores
            .get(&(*pubkey, url.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn hint_of(&self, pubkey: &PublicKey, url: &str, hint: RelayHint) -> Option<Timestamp> {
        self.state
            .lock()
            .hints
            .get(&(*pubkey, url.to_string(), hint))
            .copied()
    }

    pub fn hint_count(&self) -> usize {
        self.state.lock().hints.len()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }
}

impl EventStore for MemoryStore {
    fn followed_keys(&self, owner: &PublicKey) -> Result<Vec<PublicKey>> {
        Ok(self
            .state
            .lock()
            .follows
            .get(owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn follow(&self, owner: &PublicKey, pubkey: &PublicKey) -> Result<()> {
        self.state
            .lock()
            .follows
            .entry(*owner)
            .or_default()
            .insert(*pubkey);
        Ok(())
    }

    fn unfollow(&self, owner: &PublicKey, pubkey: &PublicKey) -> Result<()> {
        if let Some(set) = self.state.lock().follows.get_mut(owner) {
            set.remove(pubkey);
        }
        Ok(())
    }

    fn latest_timestamp_for_author(&self, pubkey: &PublicKey) -> Result<Option<Timestamp>> {
        Ok(self
            .state
            .lock()
            .events
            .values()
            .filter(|e| e.pubkey == *pubkey)
            .map(|e| e.created_at)
            .max())
    }

    fn cache_event(&self, event: &Event) -> Result<()> {
        self.state
            .lock()
            .events
            .entry(event.id)
            .or_insert_with(|| event.clone());
        Ok(())
    }

    fn query_events(&self, filter: &Filter) -> Result<Vec<Event>> {
        let state = self.state.lock();
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| filter_matches(filter, e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

impl RelayScores for MemoryStore {
    fn top_relays_for(&self, pubkey: &PublicKey, n: usize) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut ranked: HashMap<&str, f64> = HashMap::new();
        for ((pk, url), score) in &state.scores {
            if pk == pubkey {
                *ranked.entry(url.as_str()).or_default() += score;
            }
        }
        for ((pk, url, hint), when) in &state.hints {
            if pk == pubkey {
                *ranked.entry(url.as_str()).or_default() += hint.weight() * hint_score(*when);
            }
        }
        let mut ranked: Vec<(&str, f64)> = ranked.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));
        Ok(ranked
            .into_iter()
            .take(n)
            .map(|(url, _)| url.to_string())
            .collect())
    }

    fn increment_score(&self, pubkey: &PublicKey, url: &str, delta: f64) -> Result<()> {
        *self
            .state
            .lock()
            .scores
            .entry((*pubkey, url.to_string()))
            .or_default() += delta;
        Ok(())
    }

    fn record_hint(
        &self,
        pubkey: &PublicKey,
        url: &str,
        hint: RelayHint,
        when: Timestamp,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .hints
            .entry((*pubkey, url.to_string(), hint))
            .or_insert(when);
        if when > *slot {
            *slot = when;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_relay_replays_and_pushes() {
        let keys = Keys::generate();
        let relay = MockRelay::new("wss://r.example");
        relay.store(signed(&keys, Kind::TextNote, "old", 10, &[]));
        relay.store(signed(&keys, Kind::Metadata, "{}", 11, &[]));

        let id = SubscriptionId::new("t:1");
        let filter = Filter::new().kind(Kind::TextNote).author(keys.public_key());
        let mut rx = relay.subscribe(&id, &[filter]).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Notification::Event(e)) if e.content == "old"));
        assert!(matches!(rx.recv().await, Some(Notification::EndOfStoredEvents)));

        relay.push(signed(&keys, Kind::TextNote, "new", 12, &[]));
        relay.push(signed(&keys, Kind::Metadata, "{}", 13, &[]));
        assert!(matches!(rx.recv().await, Some(Notification::Event(e)) if e.content == "new"));
        assert!(rx.try_recv().is_err());

        relay.close(&id).await;
        assert!(relay.open_subscriptions().is_empty());
        assert_eq!(relay.closes(), vec!["t:1".to_string()]);
    }

    #[test]
    fn memory_store_ranks_by_score_and_hints() {
        let store = MemoryStore::new();
        let pk = Keys::generate().public_key();
        store.increment_score(&pk, "wss://a.example", 10.0).unwrap();
        store.increment_score(&pk, "wss://b.example", 20.0).unwrap();
        store
            .record_hint(&pk, "wss://c.example", RelayHint::Nip65Outbox, Timestamp::from(604_800u64 * 100))
            .unwrap();

        assert_eq!(
            store.top_relays_for(&pk, 2).unwrap(),
            vec!["wss://c.example", "wss://b.example"]
        );

        // hints only move forward
        store
            .record_hint(&pk, "wss://c.example", RelayHint::Nip65Outbox, Timestamp::from(5u64))
            .unwrap();
        assert_eq!(
            store.hint_of(&pk, "wss://c.example", RelayHint::Nip65Outbox),
            Some(Timestamp::from(604_800u64 * 100))
        );
    }
}
