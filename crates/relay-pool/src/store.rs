//! Persisted collaborators: the local event store and relay scoring.
//!
//! Both are synchronous. Implementations are expected to be fast local
//! storage; the core logs their errors and carries on as if it missed.

use nostr_sdk::{Event, Filter, PublicKey, Timestamp};

use crate::error::Result;

/// Seconds in a week. Scores are expressed in weeks since the epoch so newer
/// observations weigh a little more without discounting old ones.
pub const WEEK: u64 = 604_800;

/// Score credited to a relay each time it delivers an event from an author.
pub fn seen_score(created_at: Timestamp) -> f64 {
    2.0 * created_at.as_secs() as f64 / WEEK as f64
}

/// Base weight of a relay hint observed at `created_at`.
pub fn hint_score(created_at: Timestamp) -> f64 {
    created_at.as_secs() as f64 / WEEK as f64
}

/// How we learned that an author may be found on a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayHint {
    /// We fetched something from the author there.
    Fetched,
    /// We asked there and got nothing.
    Attempted,
    /// Someone's `p` tag pointed there.
    TagHint,
    Kind3Inbox,
    Kind3Outbox,
    Nip65Inbox,
    Nip65Outbox,
}

impl RelayHint {
    pub const ALL: [RelayHint; 7] = [
        RelayHint::Fetched,
        RelayHint::Attempted,
        RelayHint::TagHint,
        RelayHint::Kind3Inbox,
        RelayHint::Kind3Outbox,
        RelayHint::Nip65Inbox,
        RelayHint::Nip65Outbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayHint::Fetched => "last_fetched",
            RelayHint::Attempted => "last_attempted",
            RelayHint::TagHint => "tag_hint",
            RelayHint::Kind3Inbox => "kind3_inbox",
            RelayHint::Kind3Outbox => "kind3_outbox",
            RelayHint::Nip65Inbox => "nip65_inbox",
            RelayHint::Nip65Outbox => "nip65_outbox",
        }
    }

    /// Multiplier applied to [`hint_score`] when ranking relays to read an
    /// author from. Inbox hints say nothing about where an author writes.
    pub fn weight(&self) -> f64 {
        match self {
            RelayHint::Fetched => 5.0,
            RelayHint::Attempted => -5.0,
            RelayHint::TagHint => 0.5,
            RelayHint::Kind3Inbox | RelayHint::Nip65Inbox => 0.0,
            RelayHint::Kind3Outbox => 2.0,
            RelayHint::Nip65Outbox => 2.5,
        }
    }
}

/// Local copy of events and the owner's follow set.
pub trait EventStore: Send + Sync + 'static {
    fn followed_keys(&self, owner: &PublicKey) -> Result<Vec<PublicKey>>;
    fn follow(&self, owner: &PublicKey, pubkey: &PublicKey) -> Result<()>;
    fn unfollow(&self, owner: &PublicKey, pubkey: &PublicKey) -> Result<()>;
    /// Newest `created_at` stored for this author, if any.
    fn latest_timestamp_for_author(&self, pubkey: &PublicKey) -> Result<Option<Timestamp>>;
    fn cache_event(&self, event: &Event) -> Result<()>;
    /// Stored events matching `filter`, newest first.
    fn query_events(&self, filter: &Filter) -> Result<Vec<Event>>;
}

/// Per-author relay relevance.
pub trait RelayScores: Send + Sync + 'static {
    /// Best relays for reading `pubkey`, best first.
    fn top_relays_for(&self, pubkey: &PublicKey, n: usize) -> Result<Vec<String>>;
    fn increment_score(&self, pubkey: &PublicKey, url: &str, delta: f64) -> Result<()>;
    /// Record a hint. A hint never moves back in time.
    fn record_hint(
        &self,
        pubkey: &PublicKey,
        url: &str,
        hint: RelayHint,
        when: Timestamp,
    ) -> Result<()>;
}

/// Whether `event` satisfies the id/author/kind/time constraints of `filter`.
/// Tag constraints are not evaluated.
pub fn filter_matches(filter: &Filter, event: &Event) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.contains(&event.id) {
            return false;
        }
    }
    if let Some(authors) = &filter.authors {
        if !authors.contains(&event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if filter.since.is_some_and(|since| event.created_at < since) {
        return false;
    }
    if filter.until.is_some_and(|until| event.created_at > until) {
        return false;
    }
    true
}
