//! Well-known relay lists and fallback rotation.

use nostr_sdk::Kind;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::url::normalize_all;

/// Raw relay lists, usually straight from configuration.
#[derive(Debug, Clone)]
pub struct RelayLists {
    pub fallback: Vec<String>,
    pub write: Vec<String>,
    pub profile_directory: Vec<String>,
    pub contact_list_directory: Vec<String>,
    pub relay_list_directory: Vec<String>,
    pub search: Vec<String>,
}

impl Default for RelayLists {
    fn default() -> Self {
        fn list(urls: &[&str]) -> Vec<String> {
            urls.iter().map(|u| u.to_string()).collect()
        }
        Self {
            fallback: list(&[
                "wss://nos.lol",
                "wss://relay.damus.io",
                "wss://nostr.mom",
                "wss://nostr-pub.wellorder.net",
                "wss://relay.nostr.band",
            ]),
            write: list(&["wss://nos.lol", "wss://relay.damus.io"]),
            profile_directory: list(&["wss://purplepag.es", "wss://relay.nostr.band"]),
            contact_list_directory: list(&["wss://purplepag.es", "wss://relay.nostr.band"]),
            relay_list_directory: list(&["wss://purplepag.es"]),
            search: list(&["wss://relay.nostr.band", "wss://nostr.wine"]),
        }
    }
}

/// Normalized relay lists with a rotating cursor over the fallback set.
#[derive(Debug)]
pub struct RelaySets {
    fallback: Vec<String>,
    write: Vec<String>,
    profile_directory: Vec<String>,
    contact_list_directory: Vec<String>,
    relay_list_directory: Vec<String>,
    search: Vec<String>,
    cursor: AtomicUsize,
}

impl RelaySets {
    pub fn new(lists: &RelayLists) -> Self {
        Self {
            fallback: normalize_all(&lists.fallback),
            write: normalize_all(&lists.write),
            profile_directory: normalize_all(&lists.profile_directory),
            contact_list_directory: normalize_all(&lists.contact_list_directory),
            relay_list_directory: normalize_all(&lists.relay_list_directory),
            search: normalize_all(&lists.search),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next `n` fallback relays. Successive calls rotate through the list.
    pub fn fallback(&self, n: usize) -> Vec<String> {
        let len = self.fallback.len();
        if len == 0 || n == 0 {
            return Vec::new();
        }
        let n = n.min(len);
        let start = self.cursor.fetch_add(n, Ordering::Relaxed) % len;
        (0..n)
            .map(|i| self.fallback[(start + i) % len].clone())
            .collect()
    }

    /// Append rotating fallback relays to `relays` until it holds `min`
    /// distinct entries or the fallback list is exhausted.
    pub fn pad(&self, relays: &mut Vec<String>, min: usize) {
        if relays.len() >= min {
            return;
        }
        for url in self.fallback(self.fallback.len()) {
            if relays.len() >= min {
                break;
            }
            if !relays.contains(&url) {
                relays.push(url);
            }
        }
    }

    /// Directory relays that specialize in `kind`.
    pub fn directory_for(&self, kind: Kind) -> &[String] {
        match kind.as_u16() {
            0 => &self.profile_directory,
            3 => &self.contact_list_directory,
            10002 => &self.relay_list_directory,
            _ => &[],
        }
    }

    /// Whether `url` is one of the directory relays.
    pub fn is_directory(&self, url: &str) -> bool {
        self.profile_directory.iter().any(|u| u == url)
            || self.contact_list_directory.iter().any(|u| u == url)
            || self.relay_list_directory.iter().any(|u| u == url)
    }

    pub fn write(&self) -> &[String] {
        &self.write
    }

    /// Relays that answer NIP-50 search filters.
    pub fn search(&self) -> &[String] {
        &self.search
    }
}

impl Default for RelaySets {
    fn default() -> Self {
        Self::new(&RelayLists::default())
    }
}
