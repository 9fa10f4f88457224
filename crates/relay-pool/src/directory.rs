//! Typed views over replaceable events: profiles, contact lists, relay lists.

use nostr_sdk::{Event, Kind, PublicKey, ToBech32};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::Caches;
use crate::error::{Error, Result};
use crate::resolver::ReplaceableResolver;
use crate::store::EventStore;
use crate::url::normalize_url;

/// Kind 0 metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud06: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl Profile {
    /// Name to show for `pubkey`, falling back to its bech32 form.
    pub fn handle(&self, pubkey: &PublicKey) -> String {
        self.display_name
            .as_deref()
            .or(self.name.as_deref())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex()))
    }
}

/// One entry of a contact list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follow {
    pub pubkey: PublicKey,
    pub relay: Option<String>,
    pub petname: Option<String>,
}

/// Follows from the `p` tags of a kind 3 event. Invalid keys are skipped.
pub fn parse_follows(event: &Event) -> Vec<Follow> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let s = tag.as_slice();
            if s.len() < 2 || s[0] != "p" {
                return None;
            }
            let pubkey = PublicKey::from_hex(&s[1]).ok()?;
            Some(Follow {
                pubkey,
                relay: s.get(2).and_then(|r| normalize_url(r)),
                petname: s.get(3).filter(|p| !p.is_empty()).cloned(),
            })
        })
        .collect()
}

/// `(read, write)` relays from the `r` tags of a kind 10002 event.
pub fn parse_relay_list(event: &Event) -> (Vec<String>, Vec<String>) {
    let mut read = Vec::new();
    let mut write = Vec::new();
    for tag in event.tags.iter() {
        let s = tag.as_slice();
        if s.len() < 2 || s[0] != "r" {
            continue;
        }
        let Some(url) = normalize_url(&s[1]) else {
            continue;
        };
        match s.get(2).map(|m| m.as_str()) {
            Some("read") => read.push(url),
            Some("write") => write.push(url),
            None => {
                read.push(url.clone());
                write.push(url);
            }
            Some(_) => {}
        }
    }
    (read, write)
}

pub struct Directory {
    resolver: Arc<ReplaceableResolver>,
    caches: Arc<Caches>,
    store: Arc<dyn EventStore>,
}

impl Directory {
    pub fn new(
        resolver: Arc<ReplaceableResolver>,
        caches: Arc<Caches>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            resolver,
            caches,
            store,
        }
    }

    pub async fn load_profile(&self, ctx: &CancellationToken, pubkey: &PublicKey) -> Option<Profile> {
        let key = pubkey.to_hex();
        if let Some(cached) = self.caches.profiles.get(&key) {
            return cached;
        }

        let profile = match self.resolver.resolve(ctx, *pubkey, Kind::Metadata).await {
            Ok(event) => match serde_json::from_str::<Profile>(&event.content) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    debug!(pubkey = %key, "metadata event has invalid json: {e}");
                    None
                }
            },
            Err(Error::Cancelled) => return None,
            Err(e) => {
                debug!(pubkey = %key, "no metadata: {e}");
                None
            }
        };
        self.caches
            .remember(&self.caches.profiles, &key, profile.clone());
        profile
    }

    pub async fn load_contact_list(
        &self,
        ctx: &CancellationToken,
        pubkey: &PublicKey,
    ) -> Option<Vec<Follow>> {
        let key = pubkey.to_hex();
        if let Some(cached) = self.caches.contact_lists.get(&key) {
            return cached;
        }

        let follows = match self.resolver.resolve(ctx, *pubkey, Kind::ContactList).await {
            Ok(event) => Some(parse_follows(&event)),
            Err(Error::Cancelled) => return None,
            Err(e) => {
                debug!(pubkey = %key, "no contact list: {e}");
                None
            }
        };
        self.caches
            .remember(&self.caches.contact_lists, &key, follows.clone());
        follows
    }

    pub async fn load_relay_list(
        &self,
        ctx: &CancellationToken,
        pubkey: &PublicKey,
    ) -> (Vec<String>, Vec<String>) {
        match self
            .resolver
            .resolve(ctx, *pubkey, Kind::from(10002u16))
            .await
        {
            Ok(event) => parse_relay_list(&event),
            Err(_) => (Vec::new(), Vec::new()),
        }
    }

    /// Make the stored follow set of `owner` match their published contact
    /// list. Returns the number of follows.
    pub async fn sync_follows(&self, ctx: &CancellationToken, owner: &PublicKey) -> Result<usize> {
        let follows = self
            .load_contact_list(ctx, owner)
            .await
            .ok_or(Error::NotFound)?;
        let wanted: BTreeSet<PublicKey> = follows.iter().map(|f| f.pubkey).collect();

        let current = self.store.followed_keys(owner).map_err(store_error)?;
        for pk in current.iter().filter(|pk| !wanted.contains(pk)) {
            self.store.unfollow(owner, pk).map_err(store_error)?;
        }
        for pk in &wanted {
            self.store.follow(owner, pk).map_err(store_error)?;
        }
        Ok(wanted.len())
    }
}

fn store_error(e: Error) -> Error {
    match e {
        Error::Store(_) => e,
        other => Error::Store(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::registry::RelayRegistry;
    use crate::relays::{RelayLists, RelaySets};
    use crate::resolver::ResolverSettings;
    use crate::testing::{signed, MemoryStore, MockConnector};
    use nostr_sdk::Keys;

    fn directory() -> (Directory, Arc<MockConnector>, Arc<MemoryStore>) {
        let connector = Arc::new(MockConnector::new());
        let store = Arc::new(MemoryStore::new());
        let relays = RelaySets::new(&RelayLists {
            fallback: vec!["wss://r1.example".into()],
            profile_directory: Vec::new(),
            contact_list_directory: Vec::new(),
            relay_list_directory: Vec::new(),
            ..RelayLists::default()
        });
        let resolver = ReplaceableResolver::new(
            Arc::new(RelayRegistry::new(connector.clone())),
            Arc::new(MemoryKv::new()),
            store.clone(),
            store.clone(),
            Arc::new(relays),
            ResolverSettings::default(),
        );
        let directory = Directory::new(Arc::new(resolver), Arc::new(Caches::default()), store.clone());
        (directory, connector, store)
    }

    #[test]
    fn follows_from_p_tags() {
        let keys = Keys::generate();
        let bob = Keys::generate().public_key();
        let carol = Keys::generate().public_key();
        let event = signed(
            &keys,
            Kind::ContactList,
            "",
            1,
            &[
                &["p", &bob.to_hex(), "wss://bob.example/", "bobby"],
                &["p", &carol.to_hex()],
                &["p", "zz"],
                &["e", &carol.to_hex()],
            ],
        );

        assert_eq!(
            parse_follows(&event),
            vec![
                Follow {
                    pubkey: bob,
                    relay: Some("wss://bob.example".into()),
                    petname: Some("bobby".into()),
                },
                Follow {
                    pubkey: carol,
                    relay: None,
                    petname: None,
                },
            ]
        );
    }

    #[test]
    fn relay_list_read_write() {
        let keys = Keys::generate();
        let event = signed(
            &keys,
            Kind::from(10002u16),
            "",
            1,
            &[
                &["r", "wss://both.example"],
                &["r", "wss://in.example", "read"],
                &["r", "wss://out.example", "write"],
                &["r", "wss://odd.example", "sometimes"],
            ],
        );
        let (read, write) = parse_relay_list(&event);
        assert_eq!(read, vec!["wss://both.example", "wss://in.example"]);
        assert_eq!(write, vec!["wss://both.example", "wss://out.example"]);
    }

    #[tokio::test(start_paused = true)]
    async fn profiles_are_parsed_and_cached() {
        let (directory, connector, _) = directory();
        let alice = Keys::generate();
        connector.relay("wss://r1.example").store(signed(
            &alice,
            Kind::Metadata,
            r#"{"name":"alice","about":"hi"}"#,
            10,
            &[],
        ));

        let ctx = CancellationToken::new();
        let profile = directory.load_profile(&ctx, &alice.public_key()).await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(profile.handle(&alice.public_key()), "alice");

        let asked = connector.relay("wss://r1.example").reqs().len();
        assert!(directory.load_profile(&ctx, &alice.public_key()).await.is_some());
        assert_eq!(connector.relay("wss://r1.example").reqs().len(), asked);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_metadata_reads_as_absent() {
        let (directory, connector, _) = directory();
        let alice = Keys::generate();
        connector
            .relay("wss://r1.example")
            .store(signed(&alice, Kind::Metadata, "{not json", 10, &[]));

        let ctx = CancellationToken::new();
        assert!(directory.load_profile(&ctx, &alice.public_key()).await.is_none());
        assert_eq!(
            directory.caches.profiles.get(&alice.public_key().to_hex()),
            Some(None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sync_follows_replaces_follow_set() {
        let (directory, connector, store) = directory();
        let owner = Keys::generate();
        let bob = Keys::generate().public_key();
        let stale = Keys::generate().public_key();
        store.follow(&owner.public_key(), &stale).unwrap();
        connector.relay("wss://r1.example").store(signed(
            &owner,
            Kind::ContactList,
            "",
            10,
            &[&["p", &bob.to_hex()]],
        ));

        let ctx = CancellationToken::new();
        assert_eq!(directory.sync_follows(&ctx, &owner.public_key()).await, Ok(1));
        assert_eq!(store.followed_keys(&owner.public_key()).unwrap(), vec![bob]);
    }
}
