use anyhow::{Context, Result};
use nostr_sdk::{Keys, PublicKey};
use relay_pool::{
    CacheSettings, FeedSettings, HubSettings, RelayLists, ResolverSettings, Timeouts,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "relaymux";
pub const NSEC_ENV: &str = "RELAYMUX_NSEC";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub relays: RelaysConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IdentityConfig {
    /// Secret key (nsec1... or hex). Falls back to `RELAYMUX_NSEC`.
    pub nsec: Option<String>,
    /// Whose follow set drives the home feed (hex or npub).
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelaysConfig {
    #[serde(default = "default_fallback")]
    pub fallback: Vec<String>,
    #[serde(default = "default_write")]
    pub write: Vec<String>,
    #[serde(default = "default_profile_directory")]
    pub profile_directory: Vec<String>,
    #[serde(default = "default_contact_list_directory")]
    pub contact_list_directory: Vec<String>,
    #[serde(default = "default_relay_list_directory")]
    pub relay_list_directory: Vec<String>,
    #[serde(default = "default_search")]
    pub search: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FeedConfig {
    #[serde(default = "default_relays_per_author")]
    pub relays_per_author: usize,
    #[serde(default = "default_feed_min_relays")]
    pub min_relays: usize,
    #[serde(default = "default_initial_backlog")]
    pub initial_backlog: usize,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
    #[serde(default = "default_batch_wait_ms")]
    pub batch_wait_ms: u64,
    #[serde(default = "default_lookup_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_resolver_min_relays")]
    pub min_relays: usize,
    #[serde(default = "default_preferred_relays")]
    pub preferred_relays: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,
    #[serde(default = "default_hint_sample_rate")]
    pub hint_sample_rate: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_publish_ms")]
    pub publish_ms: u64,
    #[serde(default = "default_query_ms")]
    pub query_ms: u64,
    #[serde(default = "default_lookup_ms")]
    pub lookup_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_cost")]
    pub events: u64,
    #[serde(default = "default_cache_cost")]
    pub profiles: u64,
    #[serde(default = "default_cache_cost")]
    pub contact_lists: u64,
    #[serde(default = "default_not_found_ttl_secs")]
    pub not_found_ttl_secs: u64,
    #[serde(default = "default_found_ttl_secs")]
    pub found_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StorageConfig {
    /// SQLite file. Defaults to `relaymux.db` in the data directory.
    pub db_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RelaysConfig {
    fn default() -> Self {
        Self {
            fallback: default_fallback(),
            write: default_write(),
            profile_directory: default_profile_directory(),
            contact_list_directory: default_contact_list_directory(),
            relay_list_directory: default_relay_list_directory(),
            search: default_search(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            relays_per_author: default_relays_per_author(),
            min_relays: default_feed_min_relays(),
            initial_backlog: default_initial_backlog(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_capacity: default_batch_capacity(),
            batch_wait_ms: default_batch_wait_ms(),
            query_timeout_ms: default_lookup_ms(),
            min_relays: default_resolver_min_relays(),
            preferred_relays: default_preferred_relays(),
            cache_ttl_secs: default_cache_ttl_secs(),
            failure_ttl_secs: default_failure_ttl_secs(),
            hint_sample_rate: default_hint_sample_rate(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            publish_ms: default_publish_ms(),
            query_ms: default_query_ms(),
            lookup_ms: default_lookup_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            events: default_cache_cost(),
            profiles: default_cache_cost(),
            contact_lists: default_cache_cost(),
            not_found_ttl_secs: default_not_found_ttl_secs(),
            found_ttl_secs: default_found_ttl_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_fallback() -> Vec<String> {
    RelayLists::default().fallback
}
fn default_write() -> Vec<String> {
    RelayLists::default().write
}
fn default_profile_directory() -> Vec<String> {
    RelayLists::default().profile_directory
}
fn default_contact_list_directory() -> Vec<String> {
    RelayLists::default().contact_list_directory
}
fn default_relay_list_directory() -> Vec<String> {
    RelayLists::default().relay_list_directory
}
fn default_search() -> Vec<String> {
    RelayLists::default().search
}
fn default_relays_per_author() -> usize {
    3
}
fn default_feed_min_relays() -> usize {
    2
}
fn default_initial_backlog() -> usize {
    100
}
fn default_dedup_window_secs() -> u64 {
    30
}
fn default_batch_capacity() -> usize {
    400
}
fn default_batch_wait_ms() -> u64 {
    400
}
fn default_resolver_min_relays() -> usize {
    3
}
fn default_preferred_relays() -> usize {
    1
}
fn default_cache_ttl_secs() -> u64 {
    18 * 60 * 60
}
fn default_failure_ttl_secs() -> u64 {
    60 * 60
}
fn default_hint_sample_rate() -> u64 {
    10
}
fn default_connect_ms() -> u64 {
    5000
}
fn default_publish_ms() -> u64 {
    3000
}
fn default_query_ms() -> u64 {
    5000
}
fn default_lookup_ms() -> u64 {
    4000
}
fn default_cache_cost() -> u64 {
    8000
}
fn default_not_found_ttl_secs() -> u64 {
    30 * 60
}
fn default_found_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_log_level() -> String {
    "info".to_string()
}

/// `~/.config/relaymux/relaymux.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().join(format!("{APP_NAME}.toml")))
}

fn default_db_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", APP_NAME)
        .context("Could not determine a data directory; set storage.db_path")?;
    Ok(dirs.data_dir().join(format!("{APP_NAME}.db")))
}

impl Config {
    /// Read `path`, or return the defaults when no path was given and the
    /// default file does not exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).as_ref()),
            None => match default_config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.relays.fallback.is_empty() {
            anyhow::bail!("relays.fallback must list at least one relay");
        }
        let lists = [
            ("fallback", &self.relays.fallback),
            ("write", &self.relays.write),
            ("profile_directory", &self.relays.profile_directory),
            ("contact_list_directory", &self.relays.contact_list_directory),
            ("relay_list_directory", &self.relays.relay_list_directory),
            ("search", &self.relays.search),
        ];
        for (name, urls) in lists {
            for url in urls.iter() {
                if !url.starts_with("wss://") && !url.starts_with("ws://") {
                    anyhow::bail!("Relay URL in relays.{name} must start with ws:// or wss://: {url}");
                }
            }
        }
        if self.resolver.batch_capacity == 0 {
            anyhow::bail!("resolver.batch_capacity must be positive");
        }
        if self.resolver.hint_sample_rate == 0 {
            anyhow::bail!("resolver.hint_sample_rate must be positive");
        }
        Ok(())
    }

    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(path) = &self.storage.db_path {
            self.storage.db_path = Some(shellexpand::tilde(path).to_string());
        }
        Ok(())
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.storage.db_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => default_db_path(),
        }
    }

    /// Signing keys from the config or `RELAYMUX_NSEC`.
    pub fn keys(&self) -> Result<Option<Keys>> {
        let nsec = self
            .identity
            .nsec
            .clone()
            .or_else(|| std::env::var(NSEC_ENV).ok());
        match nsec {
            Some(nsec) => Ok(Some(
                Keys::parse(&nsec).with_context(|| "Failed to parse identity.nsec")?,
            )),
            None => Ok(None),
        }
    }

    /// Configured owner, else the identity's own key.
    pub fn owner(&self) -> Result<PublicKey> {
        if let Some(owner) = &self.identity.owner {
            return PublicKey::parse(owner).with_context(|| format!("Invalid owner key: {owner}"));
        }
        match self.keys()? {
            Some(keys) => Ok(keys.public_key()),
            None => anyhow::bail!("Set identity.owner or identity.nsec (or {NSEC_ENV})"),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            relays: RelayLists {
                fallback: self.relays.fallback.clone(),
                write: self.relays.write.clone(),
                profile_directory: self.relays.profile_directory.clone(),
                contact_list_directory: self.relays.contact_list_directory.clone(),
                relay_list_directory: self.relays.relay_list_directory.clone(),
                search: self.relays.search.clone(),
            },
            timeouts: Timeouts {
                connect: Duration::from_millis(self.timeouts.connect_ms),
                publish: Duration::from_millis(self.timeouts.publish_ms),
                query: Duration::from_millis(self.timeouts.query_ms),
                lookup: Duration::from_millis(self.timeouts.lookup_ms),
            },
            feed: FeedSettings {
                relays_per_author: self.feed.relays_per_author,
                min_relays: self.feed.min_relays,
                initial_backlog: self.feed.initial_backlog,
                dedup_window: Duration::from_secs(self.feed.dedup_window_secs),
            },
            resolver: ResolverSettings {
                batch_capacity: self.resolver.batch_capacity,
                batch_wait: Duration::from_millis(self.resolver.batch_wait_ms),
                query_timeout: Duration::from_millis(self.resolver.query_timeout_ms),
                min_relays: self.resolver.min_relays,
                preferred_relays: self.resolver.preferred_relays,
                cache_ttl: Duration::from_secs(self.resolver.cache_ttl_secs),
                failure_ttl: Duration::from_secs(self.resolver.failure_ttl_secs),
                hint_sample_rate: self.resolver.hint_sample_rate,
            },
            caches: CacheSettings {
                events: self.cache.events,
                profiles: self.cache.profiles,
                contact_lists: self.cache.contact_lists,
                not_found_ttl: Duration::from_secs(self.cache.not_found_ttl_secs),
                found_ttl: Duration::from_secs(self.cache.found_ttl_secs),
            },
        }
    }
}
