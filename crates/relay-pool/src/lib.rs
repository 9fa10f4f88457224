//! Relay aggregation core for relaymux
//!
//! This crate keeps one connection per relay, multiplexes many feed
//! listeners onto a single subscription per relay, batches lookups of
//! replaceable events and learns which relays serve which authors.
//! Persistence is abstracted behind [`EventStore`], [`RelayScores`] and
//! [`KvStore`]; `relay-store` provides the SQLite implementations.

pub mod cache;
pub mod connection;
pub mod directory;
pub mod error;
pub mod feed;
pub mod hints;
pub mod hub;
pub mod kv;
pub mod message;
pub mod pool;
pub mod race;
pub mod registry;
pub mod relays;
pub mod resolver;
pub mod sorted;
pub mod store;
pub mod unique;
pub mod url;
pub mod ws;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use cache::{CacheSettings, Caches, TtlCache};
pub use connection::{Connector, Notification, RelayConnection};
pub use directory::{Directory, Follow, Profile};
pub use error::{Error, Result};
pub use feed::{FeedSettings, FeedSummary, HomeFeed};
pub use hints::{extract_hints, HintRecord, Sampler};
pub use hub::{FeedStream, HubSettings, RelayHub};
pub use kv::{KvStore, MemoryKv};
pub use pool::{RelayPool, Timeouts};
pub use race::{race, race_within};
pub use registry::RelayRegistry;
pub use relays::{RelayLists, RelaySets};
pub use resolver::{supersedes, ReplaceableResolver, ResolverSettings};
pub use sorted::DescendingList;
pub use store::{filter_matches, hint_score, seen_score, EventStore, RelayHint, RelayScores};
pub use unique::SoftUnique;
pub use url::normalize_url;
pub use ws::WsConnector;

// Re-export nostr-sdk for convenience
pub use nostr_sdk;
