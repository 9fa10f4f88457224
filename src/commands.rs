use anyhow::{Context, Result};
use clap::Subcommand;
use futures_util::{Stream, StreamExt};
use nostr_sdk::{Event, EventBuilder, EventId, JsonUtil, Kind, PublicKey, ToBech32};
use relay_pool::{FeedSummary, RelayHub, WsConnector};
use relay_store::SqliteStore;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream notes from everyone the owner follows
    Feed {
        /// Owner key (hex or npub); defaults to identity.owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show an author's profile and stream their notes
    Author {
        /// Hex or npub
        key: String,
    },
    /// Print the latest version of a replaceable event
    Resolve {
        /// Hex or npub
        key: String,
        /// Event kind (0 profile, 3 contacts, 10002 relays)
        #[arg(long, default_value_t = 0)]
        kind: u16,
    },
    /// Search profiles on the configured search relays
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Fetch a single event by id
    Event {
        /// Hex or note1...
        id: String,
        /// Relays to try first
        #[arg(long = "relay")]
        relays: Vec<String>,
    },
    /// Sign a text note with the configured key and send it to the write relays
    Publish {
        text: String,
    },
    /// Add an author to the owner's follow set
    Follow {
        key: String,
    },
    /// Remove an author from the owner's follow set
    Unfollow {
        key: String,
    },
    /// Replace the owner's follow set with their published contact list
    SyncFollows,
    /// Validate configuration and open storage
    Check,
}

pub async fn handle_command(cmd: Commands, config: &Config) -> Result<()> {
    match cmd {
        Commands::Feed { owner } => cmd_feed(owner, config).await,
        Commands::Author { key } => cmd_author(&key, config).await,
        Commands::Resolve { key, kind } => cmd_resolve(&key, kind, config).await,
        Commands::Search { query, limit } => cmd_search(&query, limit, config).await,
        Commands::Event { id, relays } => cmd_event(&id, &relays, config).await,
        Commands::Publish { text } => cmd_publish(&text, config).await,
        Commands::Follow { key } => cmd_follow(&key, true, config).await,
        Commands::Unfollow { key } => cmd_follow(&key, false, config).await,
        Commands::SyncFollows => cmd_sync_follows(config).await,
        Commands::Check => cmd_check(config),
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let path = config.db_path()?;
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_hub(config: &Config) -> Result<RelayHub> {
    let store = open_store(config)?;
    Ok(RelayHub::new(
        Arc::new(WsConnector),
        store.clone(),
        store.clone(),
        Arc::new(store.kv()),
        config.hub_settings(),
    ))
}

fn parse_key(key: &str) -> Result<PublicKey> {
    PublicKey::parse(key).with_context(|| format!("Invalid public key: {key}"))
}

/// Cancel `ctx` on Ctrl-C or SIGTERM.
fn cancel_on_shutdown(ctx: &CancellationToken) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!("Failed to install signal handlers: {e}");
            return;
        }
        tracing::info!("Received shutdown signal, stopping...");
        ctx.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        },
        r = signal::ctrl_c() => {
            r.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Received Ctrl+C");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    Ok(())
}

fn print_note(event: &Event) {
    let author = event
        .pubkey
        .to_bech32()
        .unwrap_or_else(|_| event.pubkey.to_hex());
    let short = &author[..author.len().min(16)];
    println!("[{}] {short}: {}", event.created_at, event.content);
}

fn print_feed_summary(summary: &FeedSummary) {
    println!(
        "📡 Home feed: {} author(s) over {} relay(s)",
        summary.listeners.len(),
        summary.relays.len()
    );
    for (url, authors) in &summary.relays {
        println!("   {url}: {} author(s)", authors.len());
    }
}

async fn drain<S: Stream<Item = Event> + Unpin>(ctx: &CancellationToken, mut stream: S) -> usize {
    let mut count = 0;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => {
                    print_note(&event);
                    count += 1;
                }
                None => break,
            },
        }
    }
    count
}

async fn cmd_feed(owner: Option<String>, config: &Config) -> Result<()> {
    let owner = match owner {
        Some(key) => parse_key(&key)?,
        None => config.owner()?,
    };
    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    cancel_on_shutdown(&ctx);

    let stream = hub.subscribe_stream(&ctx, &owner).await?;
    let summary = hub.feed().summary();
    print_feed_summary(&summary);
    if summary.listeners.is_empty() {
        println!("⚠ {owner} follows nobody yet; try `relaymux sync-follows` or `relaymux follow <key>`");
    }

    let count = drain(&ctx, stream).await;
    ctx.cancel();
    tracing::info!(events = count, "feed closed");
    Ok(())
}

async fn cmd_author(key: &str, config: &Config) -> Result<()> {
    let pubkey = parse_key(key)?;
    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    cancel_on_shutdown(&ctx);

    match hub.directory().load_profile(&ctx, &pubkey).await {
        Some(profile) => {
            println!("👤 {}", profile.handle(&pubkey));
            if let Some(about) = &profile.about {
                println!("   {about}");
            }
            if let Some(nip05) = &profile.nip05 {
                println!("   nip05: {nip05}");
            }
        }
        None => println!("👤 {} (no profile found)", pubkey.to_hex()),
    }

    let stream = hub.subscribe_author(&ctx, &pubkey).await;
    drain(&ctx, stream).await;
    ctx.cancel();
    Ok(())
}

async fn cmd_resolve(key: &str, kind: u16, config: &Config) -> Result<()> {
    let pubkey = parse_key(key)?;
    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    cancel_on_shutdown(&ctx);

    let event = hub
        .resolve_latest(&ctx, &pubkey, Kind::from(kind))
        .await
        .with_context(|| format!("No kind {kind} event found for {key}"))?;
    println!("{}", event.as_json());
    Ok(())
}

async fn cmd_search(query: &str, limit: usize, config: &Config) -> Result<()> {
    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    cancel_on_shutdown(&ctx);

    let found = hub.search_profiles(&ctx, query, limit).await;
    if found.is_empty() {
        println!("No profiles matched \"{query}\"");
    }
    for (pubkey, profile) in found {
        let npub = pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex());
        println!("👤 {} {npub}", profile.handle(&pubkey));
    }
    Ok(())
}

async fn cmd_event(id: &str, relays: &[String], config: &Config) -> Result<()> {
    let id = EventId::parse(id).with_context(|| format!("Invalid event id: {id}"))?;
    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    cancel_on_shutdown(&ctx);

    match hub.fetch_event(&ctx, &id, relays).await {
        Some(event) => {
            println!("{}", event.as_json());
            Ok(())
        }
        None => anyhow::bail!("Event {} not found", id.to_hex()),
    }
}

async fn cmd_publish(text: &str, config: &Config) -> Result<()> {
    let keys = config
        .keys()?
        .context("Publishing needs identity.nsec (or RELAYMUX_NSEC)")?;
    let event = EventBuilder::text_note(text)
        .sign_with_keys(&keys)
        .with_context(|| "Failed to sign note")?;

    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    let relay = hub
        .publish(&ctx, &event, &[])
        .await
        .with_context(|| "No relay accepted the note")?;
    println!("✅ Published {} via {relay}", event.id.to_hex());
    Ok(())
}

async fn cmd_follow(key: &str, follow: bool, config: &Config) -> Result<()> {
    let owner = config.owner()?;
    let pubkey = parse_key(key)?;
    let store = open_store(config)?;
    if follow {
        relay_pool::EventStore::follow(store.as_ref(), &owner, &pubkey)?;
        println!("✅ Following {}", pubkey.to_hex());
    } else {
        relay_pool::EventStore::unfollow(store.as_ref(), &owner, &pubkey)?;
        println!("✅ Unfollowed {}", pubkey.to_hex());
    }
    Ok(())
}

async fn cmd_sync_follows(config: &Config) -> Result<()> {
    let owner = config.owner()?;
    let hub = build_hub(config)?;
    let ctx = CancellationToken::new();
    cancel_on_shutdown(&ctx);

    let count = hub
        .directory()
        .sync_follows(&ctx, &owner)
        .await
        .with_context(|| "Could not load the owner's contact list")?;
    println!("✅ Synced {count} follows for {}", owner.to_hex());
    Ok(())
}

fn cmd_check(config: &Config) -> Result<()> {
    println!("✓ Configuration is valid");
    println!("  Fallback relays: {}", config.relays.fallback.join(", "));

    match config.keys()? {
        Some(keys) => println!("✓ Identity: {}", keys.public_key().to_hex()),
        None => println!("⚠ No identity configured (publishing disabled)"),
    }
    match config.owner() {
        Ok(owner) => println!("✓ Owner: {}", owner.to_hex()),
        Err(e) => println!("⚠ {e}"),
    }

    let store = open_store(config)?;
    let path = config.db_path()?;
    println!("✓ Database: {}", path.display());
    println!("  Stored events: {}", store.event_count()?);
    let purged = store.kv().purge_expired()?;
    if purged > 0 {
        println!("  Purged {purged} expired cache entries");
    }
    Ok(())
}
