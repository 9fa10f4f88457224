//! Entry point wiring the registry, pool, feed, resolver and caches together.

use futures_util::future::join_all;
use nostr_sdk::{Event, EventId, Filter, Kind, PublicKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheSettings, Caches};
use crate::connection::Connector;
use crate::directory::{Directory, Profile};
use crate::error::Result;
use crate::feed::{FeedSettings, HomeFeed};
use crate::kv::KvStore;
use crate::pool::{RelayPool, Timeouts};
use crate::registry::RelayRegistry;
use crate::relays::{RelayLists, RelaySets};
use crate::resolver::{supersedes, ReplaceableResolver, ResolverSettings};
use crate::sorted::DescendingList;
use crate::store::{EventStore, RelayScores};
use crate::unique::SoftUnique;
use crate::url::normalize_all;

/// Home feed stream with short-window duplicate suppression.
pub type FeedStream = SoftUnique<ReceiverStream<Event>>;

#[derive(Debug, Clone, Default)]
pub struct HubSettings {
    pub relays: RelayLists,
    pub timeouts: Timeouts,
    pub feed: FeedSettings,
    pub resolver: ResolverSettings,
    pub caches: CacheSettings,
}

pub struct RelayHub {
    registry: Arc<RelayRegistry>,
    store: Arc<dyn EventStore>,
    scores: Arc<dyn RelayScores>,
    relays: Arc<RelaySets>,
    pool: RelayPool,
    feed: HomeFeed,
    resolver: Arc<ReplaceableResolver>,
    directory: Directory,
    author_backlog: usize,
    dedup_window: Duration,
}

impl RelayHub {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn EventStore>,
        scores: Arc<dyn RelayScores>,
        kv: Arc<dyn KvStore>,
        settings: HubSettings,
    ) -> Self {
        let registry = Arc::new(RelayRegistry::with_timeout(
            connector,
            settings.timeouts.connect,
        ));
        let relays = Arc::new(RelaySets::new(&settings.relays));
        let caches = Arc::new(Caches::new(settings.caches));

        let pool = RelayPool::new(
            registry.clone(),
            store.clone(),
            scores.clone(),
            caches.clone(),
            relays.clone(),
            settings.timeouts,
        );
        let author_backlog = settings.feed.initial_backlog;
        let dedup_window = settings.feed.dedup_window;
        let feed = HomeFeed::new(
            registry.clone(),
            store.clone(),
            scores.clone(),
            relays.clone(),
            settings.feed,
        );
        let resolver = Arc::new(ReplaceableResolver::new(
            registry.clone(),
            kv,
            store.clone(),
            scores.clone(),
            relays.clone(),
            settings.resolver,
        ));
        let directory = Directory::new(resolver.clone(), caches, store.clone());

        Self {
            registry,
            store,
            scores,
            relays,
            pool,
            feed,
            resolver,
            directory,
            author_backlog,
            dedup_window,
        }
    }

    /// Notes from everyone `owner` follows, until `ctx` is cancelled.
    pub async fn subscribe_stream(
        &self,
        ctx: &CancellationToken,
        owner: &PublicKey,
    ) -> Result<FeedStream> {
        let follows = self.store.followed_keys(owner)?;
        debug!(owner = %owner.to_hex(), follows = follows.len(), "subscribing home feed");
        let stream = self.feed.add_listener(ctx, &follows).await;
        Ok(SoftUnique::with_window(stream, self.dedup_window))
    }

    /// Profile and notes of a single author, from their scored relays and
    /// declared outboxes.
    pub async fn subscribe_author(
        &self,
        ctx: &CancellationToken,
        pubkey: &PublicKey,
    ) -> ReceiverStream<Event> {
        let mut urls = self.scores.top_relays_for(pubkey, 3).unwrap_or_default();
        let (_, outboxes) = self.directory.load_relay_list(ctx, pubkey).await;
        urls.extend(outboxes);
        let mut urls = normalize_all(&urls);
        self.relays.pad(&mut urls, 3);

        let filter = Filter::new()
            .author(*pubkey)
            .kinds([Kind::Metadata, Kind::TextNote])
            .limit(self.author_backlog);
        self.pool.sub_many(ctx, &urls, vec![filter])
    }

    pub async fn resolve_latest(
        &self,
        ctx: &CancellationToken,
        pubkey: &PublicKey,
        kind: Kind,
    ) -> Result<Event> {
        self.resolver.resolve(ctx, *pubkey, kind).await
    }

    /// Publish to `targets`, or to the configured write relays when empty.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        targets: &[String],
    ) -> Result<String> {
        let targets = if targets.is_empty() {
            self.relays.write().to_vec()
        } else {
            normalize_all(targets)
        };
        self.pool.publish(ctx, event, &targets).await
    }

    pub async fn fetch_event(
        &self,
        ctx: &CancellationToken,
        id: &EventId,
        hints: &[String],
    ) -> Option<Event> {
        self.pool.fetch_event(ctx, id, hints).await
    }

    /// NIP-50 profile search over the search relays. Keeps the newest
    /// metadata per author, most recently updated first.
    pub async fn search_profiles(
        &self,
        ctx: &CancellationToken,
        query: &str,
        limit: usize,
    ) -> Vec<(PublicKey, Profile)> {
        let filter = Filter::new().kind(Kind::Metadata).search(query).limit(limit);
        let batches = join_all(
            self.relays
                .search()
                .iter()
                .map(|url| self.pool.query_sync(ctx, url, vec![filter.clone()], None)),
        )
        .await;

        let mut newest: HashMap<PublicKey, Event> = HashMap::new();
        for event in batches.into_iter().flatten() {
            if event.kind != Kind::Metadata {
                continue;
            }
            let replace = newest
                .get(&event.pubkey)
                .map_or(true, |current| supersedes(&event, current));
            if replace {
                newest.insert(event.pubkey, event);
            }
        }

        let mut ordered = DescendingList::new();
        ordered.extend(newest.into_values());
        ordered
            .into_vec()
            .into_iter()
            .filter_map(|event| {
                serde_json::from_str::<Profile>(&event.content)
                    .ok()
                    .map(|profile| (event.pubkey, profile))
            })
            .take(limit)
            .collect()
    }

    pub fn follow(&self, owner: &PublicKey, pubkey: &PublicKey) -> Result<()> {
        self.store.follow(owner, pubkey)
    }

    pub fn unfollow(&self, owner: &PublicKey, pubkey: &PublicKey) -> Result<()> {
        self.store.unfollow(owner, pubkey)
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn feed(&self) -> &HomeFeed {
        &self.feed
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::testing::{eventually, signed, MemoryStore, MockConnector};
    use futures_util::StreamExt;
    use nostr_sdk::Keys;

    fn hub() -> (RelayHub, Arc<MockConnector>, Arc<MemoryStore>) {
        let connector = Arc::new(MockConnector::new());
        let store = Arc::new(MemoryStore::new());
        let settings = HubSettings {
            relays: RelayLists {
                fallback: vec!["wss://r1.example".into(), "wss://r2.example".into()],
                write: vec!["wss://w.example".into()],
                profile_directory: Vec::new(),
                contact_list_directory: Vec::new(),
                relay_list_directory: Vec::new(),
                search: vec!["wss://search.example".into()],
            },
            ..HubSettings::default()
        };
        let hub = RelayHub::new(
            connector.clone(),
            store.clone(),
            store.clone(),
            Arc::new(MemoryKv::new()),
            settings,
        );
        (hub, connector, store)
    }

    #[tokio::test]
    async fn home_feed_drops_cross_relay_duplicates() {
        let (hub, connector, _) = hub();
        let owner = Keys::generate().public_key();
        let bob = Keys::generate();
        hub.follow(&owner, &bob.public_key()).unwrap();

        let ctx = CancellationToken::new();
        let mut stream = hub.subscribe_stream(&ctx, &owner).await.unwrap();

        let r1 = connector.relay("wss://r1.example");
        let r2 = connector.relay("wss://r2.example");
        eventually(|| r1.open_subscriptions().len() == 1 && r2.open_subscriptions().len() == 1).await;

        let note = signed(&bob, Kind::TextNote, "hello", 10, &[]);
        let later = signed(&bob, Kind::TextNote, "again", 11, &[]);
        r1.push(note.clone());
        r2.push(note.clone());
        r2.push(later.clone());

        assert_eq!(stream.next().await.map(|e| e.id), Some(note.id));
        assert_eq!(stream.next().await.map(|e| e.id), Some(later.id));

        ctx.cancel();
        eventually(|| hub.feed().summary().is_empty()).await;
    }

    #[tokio::test]
    async fn publish_defaults_to_write_relays() {
        let (hub, connector, _) = hub();
        let keys = Keys::generate();
        let note = signed(&keys, Kind::TextNote, "hi", 10, &[]);

        let ctx = CancellationToken::new();
        let url = hub.publish(&ctx, &note, &[]).await.unwrap();
        assert_eq!(url, "wss://w.example");
        assert_eq!(connector.relay("wss://w.example").published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn author_stream_uses_declared_outboxes() {
        let (hub, connector, _) = hub();
        let alice = Keys::generate();
        connector.relay("wss://r1.example").store(signed(
            &alice,
            Kind::from(10002u16),
            "",
            5,
            &[&["r", "wss://alice.example", "write"]],
        ));
        let note = signed(&alice, Kind::TextNote, "mine", 10, &[]);
        connector.relay("wss://alice.example").store(note.clone());

        let ctx = CancellationToken::new();
        let mut stream = hub.subscribe_author(&ctx, &alice.public_key()).await;
        let got = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
        assert_eq!(got.ok().flatten().map(|e| e.id), Some(note.id));
        ctx.cancel();
    }

    #[tokio::test]
    async fn profile_search_uses_search_relays_and_keeps_newest() {
        let (hub, connector, _) = hub();
        let alice = Keys::generate();
        let bob = Keys::generate();
        let search = connector.relay("wss://search.example");
        search.store(signed(&alice, Kind::Metadata, r#"{"name":"alice-old"}"#, 10, &[]));
        search.store(signed(&alice, Kind::Metadata, r#"{"name":"alice"}"#, 30, &[]));
        search.store(signed(&bob, Kind::Metadata, r#"{"name":"bob"}"#, 20, &[]));

        let ctx = CancellationToken::new();
        let found = hub.search_profiles(&ctx, "ali", 10).await;
        let names: Vec<_> = found
            .iter()
            .map(|(pk, p)| (*pk, p.name.clone().unwrap_or_default()))
            .collect();
        assert_eq!(
            names,
            vec![
                (alice.public_key(), "alice".to_string()),
                (bob.public_key(), "bob".to_string()),
            ]
        );
        assert!(connector.relay("wss://r1.example").reqs().is_empty());
        assert_eq!(search.reqs().len(), 1);
    }
}
