//! relay-pool components running on the SQLite stores.

use futures_util::StreamExt;
use nostr_sdk::{Keys, Kind};
use relay_pool::testing::{eventually, signed, MockConnector};
use relay_pool::{
    EventStore, FeedSettings, HomeFeed, RelayLists, RelayRegistry, RelayScores, RelaySets,
    ReplaceableResolver, ResolverSettings,
};
use relay_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn relays() -> Arc<RelaySets> {
    Arc::new(RelaySets::new(&RelayLists {
        fallback: vec!["wss://r1.example".into(), "wss://r2.example".into()],
        profile_directory: Vec::new(),
        contact_list_directory: Vec::new(),
        relay_list_directory: Vec::new(),
        ..RelayLists::default()
    }))
}

fn resolver(connector: Arc<MockConnector>, store: &SqliteStore) -> ReplaceableResolver {
    let store = Arc::new(store.clone());
    ReplaceableResolver::new(
        Arc::new(RelayRegistry::new(connector)),
        Arc::new(store.kv()),
        store.clone(),
        store,
        relays(),
        ResolverSettings {
            batch_wait: Duration::from_millis(20),
            ..ResolverSettings::default()
        },
    )
}

#[tokio::test]
async fn resolved_events_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relaymux.db");
    let alice = Keys::generate();
    let profile = signed(&alice, Kind::Metadata, r#"{"name":"alice"}"#, 100, &[]);
    let ctx = CancellationToken::new();

    {
        let store = SqliteStore::open(&path).unwrap();
        let connector = Arc::new(MockConnector::new());
        connector.relay("wss://r1.example").store(profile.clone());

        let got = resolver(connector, &store)
            .resolve(&ctx, alice.public_key(), Kind::Metadata)
            .await
            .unwrap();
        assert_eq!(got.id, profile.id);
        assert_eq!(store.event_count().unwrap(), 1);
    }

    let store = SqliteStore::open(&path).unwrap();
    let connector = Arc::new(MockConnector::new());
    let got = resolver(connector.clone(), &store)
        .resolve(&ctx, alice.public_key(), Kind::Metadata)
        .await
        .unwrap();
    assert_eq!(got.id, profile.id);
    assert!(connector.relay("wss://r1.example").reqs().is_empty());
}

#[tokio::test]
async fn feed_deliveries_train_relay_ranking() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let connector = Arc::new(MockConnector::new());
    let feed = HomeFeed::new(
        Arc::new(RelayRegistry::new(connector.clone())),
        store.clone(),
        store.clone(),
        relays(),
        FeedSettings::default(),
    );
    let bob = Keys::generate();

    let ctx = CancellationToken::new();
    let mut stream = feed.add_listener(&ctx, &[bob.public_key()]).await;
    let r2 = connector.relay("wss://r2.example");
    eventually(|| r2.open_subscriptions().len() == 1).await;

    r2.push(signed(&bob, Kind::TextNote, "hi", 1_000_000, &[]));
    assert_eq!(stream.next().await.map(|e| e.content), Some("hi".to_string()));

    eventually(|| {
        store.top_relays_for(&bob.public_key(), 1).unwrap_or_default()
            == vec!["wss://r2.example".to_string()]
    })
    .await;
    eventually(|| {
        store
            .latest_timestamp_for_author(&bob.public_key())
            .ok()
            .flatten()
            .is_some()
    })
    .await;

    ctx.cancel();
}
