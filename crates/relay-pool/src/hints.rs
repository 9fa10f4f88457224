//! Relay discovery from event content and tags.

use nostr_sdk::{Event, PublicKey, Timestamp};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::RelayHint;
use crate::url::normalize_url;

/// One piece of evidence that `pubkey` uses `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct HintRecord {
    pub pubkey: PublicKey,
    pub url: String,
    pub hint: RelayHint,
    pub when: Timestamp,
}

#[derive(Deserialize)]
struct Kind3Policy {
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
}

/// Aggregator endpoints that show up in relay lists but never hold anyone's notes.
fn ignored(url: &str) -> bool {
    url == "wss://feeds.nostr.band" || url.starts_with("wss://filter.nostr.wine")
}

/// Every relay hint carried by `event`.
pub fn extract_hints(event: &Event) -> Vec<HintRecord> {
    let mut hints = Vec::new();
    let mut push = |pubkey: PublicKey, url: String, hint: RelayHint| {
        hints.push(HintRecord {
            pubkey,
            url,
            hint,
            when: event.created_at,
        });
    };

    for tag in event.tags.iter() {
        let s = tag.as_slice();
        if s.len() < 3 || s[0] != "p" {
            continue;
        }
        let (Ok(pubkey), Some(url)) = (PublicKey::from_hex(&s[1]), normalize_url(&s[2])) else {
            continue;
        };
        push(pubkey, url, RelayHint::TagHint);
    }

    match event.kind.as_u16() {
        3 => {
            let Ok(policies) = serde_json::from_str::<HashMap<String, Kind3Policy>>(&event.content)
            else {
                return hints;
            };
            let mut policies: Vec<_> = policies.into_iter().collect();
            policies.sort_by(|a, b| a.0.cmp(&b.0));
            for (raw, policy) in policies {
                let Some(url) = normalize_url(&raw).filter(|u| !ignored(u)) else {
                    continue;
                };
                if policy.read {
                    push(event.pubkey, url.clone(), RelayHint::Kind3Inbox);
                }
                if policy.write {
                    push(event.pubkey, url, RelayHint::Kind3Outbox);
                }
            }
        }
        10002 => {
            for tag in event.tags.iter() {
                let s = tag.as_slice();
                if s.len() < 2 || s[0] != "r" {
                    continue;
                }
                let Some(url) = normalize_url(&s[1]).filter(|u| !ignored(u)) else {
                    continue;
                };
                let marker = s.get(2).map(|m| m.as_str());
                if marker != Some("write") {
                    push(event.pubkey, url.clone(), RelayHint::Nip65Inbox);
                }
                if marker != Some("read") {
                    push(event.pubkey, url, RelayHint::Nip65Outbox);
                }
            }
        }
        _ => {}
    }

    hints
}

/// Lets through one call in every `every`.
#[derive(Debug)]
pub struct Sampler {
    every: u64,
    counter: AtomicU64,
}

impl Sampler {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            counter: AtomicU64::new(0),
        }
    }

    pub fn sample(&self) -> bool {
        (self.counter.fetch_add(1, Ordering::Relaxed) + 1) % self.every == 0
    }
}
