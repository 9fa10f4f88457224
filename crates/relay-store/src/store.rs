//! Events, follows and relay scores backed by SQLite.
//!
//! The connection sits behind a `parking_lot::Mutex` so a guard is never
//! held across an `.await`; every operation is a short synchronous query.

use nostr_sdk::{Event, Filter, PublicKey, Timestamp};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use relay_pool::store::WEEK;
use relay_pool::{EventStore, RelayHint, RelayScores};

use crate::error::StoreError;
use crate::kv::SqliteKv;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id          TEXT PRIMARY KEY,
        pubkey      TEXT NOT NULL,
        kind        INTEGER NOT NULL,
        created_at  INTEGER NOT NULL,
        json        TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_author
        ON events(pubkey, created_at);
    CREATE INDEX IF NOT EXISTS idx_events_kind
        ON events(kind, created_at);

    CREATE TABLE IF NOT EXISTS follows (
        owner   TEXT NOT NULL,
        pubkey  TEXT NOT NULL,
        PRIMARY KEY (owner, pubkey)
    );

    CREATE TABLE IF NOT EXISTS relay_scores (
        pubkey          TEXT NOT NULL,
        relay           TEXT NOT NULL,
        score           REAL NOT NULL DEFAULT 0,
        last_fetched    INTEGER,
        last_attempted  INTEGER,
        tag_hint        INTEGER,
        kind3_inbox     INTEGER,
        kind3_outbox    INTEGER,
        nip65_inbox     INTEGER,
        nip65_outbox    INTEGER,
        PRIMARY KEY (pubkey, relay)
    );

    CREATE TABLE IF NOT EXISTS kv (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        expires_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_kv_expires_at
        ON kv(expires_at);
";

pub(crate) fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous  = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub(crate) fn open_memory_connection() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// `score` plus every hint column scaled by its weight, in weeks.
fn rank_expr() -> String {
    let mut expr = String::from("score");
    for hint in RelayHint::ALL {
        let weight = hint.weight();
        if weight == 0.0 {
            continue;
        }
        expr.push_str(&format!(
            " + ({weight:.1} * COALESCE({}, 0) / {WEEK}.0)",
            hint.as_str()
        ));
    }
    expr
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        debug!(path = %path.display(), "opened relay store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_memory_connection()?)),
        })
    }

    /// Key-value store on the same connection.
    pub fn kv(&self) -> SqliteKv {
        SqliteKv::from_shared(self.conn.clone())
    }

    pub fn event_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Raw score and hints of one (author, relay) pair.
    pub fn relay_row(
        &self,
        pubkey: &PublicKey,
        url: &str,
    ) -> Result<Option<(f64, Vec<(RelayHint, Timestamp)>)>, StoreError> {
        let conn = self.conn.lock();
        let columns: Vec<&str> = RelayHint::ALL.iter().map(|h| h.as_str()).collect();
        let sql = format!(
            "SELECT score, {} FROM relay_scores WHERE pubkey = ?1 AND relay = ?2",
            columns.join(", ")
        );
        let row = conn
            .query_row(&sql, params![pubkey.to_hex(), url], |row| {
                let score: f64 = row.get(0)?;
                let mut hints = Vec::new();
                for (i, hint) in RelayHint::ALL.iter().enumerate() {
                    if let Some(when) = row.get::<_, Option<i64>>(i + 1)? {
                        hints.push((*hint, Timestamp::from(when as u64)));
                    }
                }
                Ok((score, hints))
            })
            .optional()?;
        Ok(row)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> relay_pool::Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(relay_pool::Error::from)
    }
}

impl EventStore for SqliteStore {
    fn followed_keys(&self, owner: &PublicKey) -> relay_pool::Result<Vec<PublicKey>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT pubkey FROM follows WHERE owner = ?1 ORDER BY pubkey")?;
            let keys = stmt
                .query_map(params![owner.to_hex()], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .filter_map(|hex| PublicKey::from_hex(&hex).ok())
                .collect();
            Ok(keys)
        })
    }

    fn follow(&self, owner: &PublicKey, pubkey: &PublicKey) -> relay_pool::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO follows (owner, pubkey) VALUES (?1, ?2)",
                params![owner.to_hex(), pubkey.to_hex()],
            )?;
            Ok(())
        })
    }

    fn unfollow(&self, owner: &PublicKey, pubkey: &PublicKey) -> relay_pool::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM follows WHERE owner = ?1 AND pubkey = ?2",
                params![owner.to_hex(), pubkey.to_hex()],
            )?;
            Ok(())
        })
    }

    fn latest_timestamp_for_author(
        &self,
        pubkey: &PublicKey,
    ) -> relay_pool::Result<Option<Timestamp>> {
        self.with_conn(|conn| {
            let latest: Option<i64> = conn.query_row(
                "SELECT MAX(created_at) FROM events WHERE pubkey = ?1",
                params![pubkey.to_hex()],
                |row| row.get(0),
            )?;
            Ok(latest.map(|secs| Timestamp::from(secs as u64)))
        })
    }

    fn cache_event(&self, event: &Event) -> relay_pool::Result<()> {
        self.with_conn(|conn| {
            let json = serde_json::to_string(event)?;
            conn.execute(
                "INSERT OR IGNORE INTO events (id, pubkey, kind, created_at, json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_hex(),
                    event.pubkey.to_hex(),
                    event.kind.as_u16() as i64,
                    event.created_at.as_secs() as i64,
                    json,
                ],
            )?;
            Ok(())
        })
    }

    fn query_events(&self, filter: &Filter) -> relay_pool::Result<Vec<Event>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        fn any_of(column: &str, values: Vec<Value>, clauses: &mut Vec<String>, args: &mut Vec<Value>) {
            let marks = vec!["?"; values.len()].join(", ");
            clauses.push(format!("{column} IN ({marks})"));
            args.extend(values);
        }

        if let Some(ids) = &filter.ids {
            let values = ids.iter().map(|id| Value::Text(id.to_hex())).collect();
            any_of("id", values, &mut clauses, &mut args);
        }
        if let Some(authors) = &filter.authors {
            let values = authors.iter().map(|pk| Value::Text(pk.to_hex())).collect();
            any_of("pubkey", values, &mut clauses, &mut args);
        }
        if let Some(kinds) = &filter.kinds {
            let values = kinds
                .iter()
                .map(|k| Value::Integer(k.as_u16() as i64))
                .collect();
            any_of("kind", values, &mut clauses, &mut args);
        }
        if let Some(since) = filter.since {
            clauses.push("created_at >= ?".into());
            args.push(Value::Integer(since.as_secs() as i64));
        }
        if let Some(until) = filter.until {
            clauses.push("created_at <= ?".into());
            args.push(Value::Integer(until.as_secs() as i64));
        }

        let mut sql = String::from("SELECT json FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
            let mut events = Vec::new();
            for json in rows.filter_map(|r| r.ok()) {
                match serde_json::from_str::<Event>(&json) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("skipping unreadable stored event: {e}"),
                }
            }
            Ok(events)
        })
    }
}

impl RelayScores for SqliteStore {
    fn top_relays_for(&self, pubkey: &PublicKey, n: usize) -> relay_pool::Result<Vec<String>> {
        let sql = format!(
            "SELECT relay, {} AS rank FROM relay_scores
             WHERE pubkey = ?1
             ORDER BY rank DESC, relay ASC
             LIMIT ?2",
            rank_expr()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let relays = stmt
                .query_map(params![pubkey.to_hex(), n as i64], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(relays)
        })
    }

    fn increment_score(&self, pubkey: &PublicKey, url: &str, delta: f64) -> relay_pool::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO relay_scores (pubkey, relay, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(pubkey, relay) DO UPDATE SET score = score + excluded.score",
                params![pubkey.to_hex(), url, delta],
            )?;
            Ok(())
        })
    }

    fn record_hint(
        &self,
        pubkey: &PublicKey,
        url: &str,
        hint: RelayHint,
        when: Timestamp,
    ) -> relay_pool::Result<()> {
        let column = hint.as_str();
        let sql = format!(
            "INSERT INTO relay_scores (pubkey, relay, {column}) VALUES (?1, ?2, ?3)
             ON CONFLICT(pubkey, relay) DO UPDATE
             SET {column} = MAX(COALESCE({column}, 0), excluded.{column})"
        );
        self.with_conn(|conn| {
            conn.execute(&sql, params![pubkey.to_hex(), url, when.as_secs() as i64])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{Keys, Kind};
    use relay_pool::testing::signed;
    use tempfile::TempDir;

    fn week(n: u64) -> Timestamp {
        Timestamp::from(n * WEEK)
    }

    #[test]
    fn rank_expression_skips_inbox_hints() {
        let expr = rank_expr();
        assert!(expr.contains("5.0 * COALESCE(last_fetched, 0)"));
        assert!(expr.contains("-5.0 * COALESCE(last_attempted, 0)"));
        assert!(expr.contains("2.5 * COALESCE(nip65_outbox, 0)"));
        assert!(!expr.contains("kind3_inbox"));
        assert!(!expr.contains("nip65_inbox"));
    }

    #[test]
    fn follows_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let owner = Keys::generate().public_key();
        let bob = Keys::generate().public_key();
        let carol = Keys::generate().public_key();

        store.follow(&owner, &bob).unwrap();
        store.follow(&owner, &bob).unwrap();
        store.follow(&owner, &carol).unwrap();
        assert_eq!(store.followed_keys(&owner).unwrap().len(), 2);

        store.unfollow(&owner, &bob).unwrap();
        assert_eq!(store.followed_keys(&owner).unwrap(), vec![carol]);
        assert!(store.followed_keys(&bob).unwrap().is_empty());
    }

    #[test]
    fn events_are_queried_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = Keys::generate();
        let bob = Keys::generate();
        for (keys, t) in [(&alice, 10), (&alice, 30), (&alice, 20), (&bob, 40)] {
            store
                .cache_event(&signed(keys, Kind::TextNote, &t.to_string(), t, &[]))
                .unwrap();
        }
        store
            .cache_event(&signed(&alice, Kind::Metadata, "{}", 50, &[]))
            .unwrap();

        let filter = Filter::new()
            .author(alice.public_key())
            .kind(Kind::TextNote)
            .since(Timestamp::from(15))
            .limit(5);
        let times: Vec<u64> = store
            .query_events(&filter)
            .unwrap()
            .iter()
            .map(|e| e.created_at.as_secs())
            .collect();
        assert_eq!(times, vec![30, 20]);

        assert_eq!(
            store.latest_timestamp_for_author(&alice.public_key()).unwrap(),
            Some(Timestamp::from(50))
        );
        assert_eq!(
            store
                .latest_timestamp_for_author(&Keys::generate().public_key())
                .unwrap(),
            None
        );
        assert_eq!(store.event_count().unwrap(), 5);
    }

    #[test]
    fn events_by_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let keys = Keys::generate();
        let event = signed(&keys, Kind::TextNote, "x", 10, &[]);
        store.cache_event(&event).unwrap();
        store.cache_event(&event).unwrap();

        let got = store.query_events(&Filter::new().id(event.id)).unwrap();
        assert_eq!(got, vec![event]);
    }

    #[test]
    fn ranking_combines_score_and_hints() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pk = Keys::generate().public_key();

        // 2.5 * 100 = 250
        store
            .record_hint(&pk, "wss://outbox.example", RelayHint::Nip65Outbox, week(100))
            .unwrap();
        // 5 * 100 - 5 * 100 = 0, plus score 10
        store
            .record_hint(&pk, "wss://flaky.example", RelayHint::Fetched, week(100))
            .unwrap();
        store
            .record_hint(&pk, "wss://flaky.example", RelayHint::Attempted, week(100))
            .unwrap();
        store.increment_score(&pk, "wss://flaky.example", 10.0).unwrap();
        // 5 * 100 = 500
        store
            .record_hint(&pk, "wss://home.example", RelayHint::Fetched, week(100))
            .unwrap();
        // inbox only: 0
        store
            .record_hint(&pk, "wss://inbox.example", RelayHint::Nip65Inbox, week(100))
            .unwrap();

        assert_eq!(
            store.top_relays_for(&pk, 10).unwrap(),
            vec![
                "wss://home.example",
                "wss://outbox.example",
                "wss://flaky.example",
                "wss://inbox.example",
            ]
        );
        assert_eq!(store.top_relays_for(&pk, 1).unwrap(), vec!["wss://home.example"]);
    }

    #[test]
    fn hints_only_move_forward() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pk = Keys::generate().public_key();
        let url = "wss://r.example";

        store.record_hint(&pk, url, RelayHint::TagHint, week(5)).unwrap();
        store.record_hint(&pk, url, RelayHint::TagHint, week(3)).unwrap();
        store.increment_score(&pk, url, 1.5).unwrap();
        store.increment_score(&pk, url, 1.5).unwrap();

        let (score, hints) = store.relay_row(&pk, url).unwrap().unwrap();
        assert_eq!(score, 3.0);
        assert_eq!(hints, vec![(RelayHint::TagHint, week(5))]);
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("relaymux.db");
        let owner = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.follow(&owner, &bob).unwrap();
            store.increment_score(&bob, "wss://r.example", 2.0).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.followed_keys(&owner).unwrap(), vec![bob]);
        assert_eq!(store.top_relays_for(&bob, 3).unwrap(), vec!["wss://r.example"]);
    }
}
