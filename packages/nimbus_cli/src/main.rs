//! `nimbus`: feed inspection and ledger nodes.
//!
//! ```text
//! nimbus feed create                          # new writable feed, prints its key
//! nimbus feed append <KEY> "some text"        # append one entry
//! nimbus feed append <KEY> --file photo.jpg   # append a file in chunks
//! nimbus feed get <KEY> 3                     # print entry 3
//! nimbus feed head <KEY>                      # length, head hash and root
//! nimbus feed audit <KEY>                     # re-verify the whole chain
//! nimbus node --topic room --listen 0.0.0.0:7070
//! nimbus node --topic room --bootstrap 10.0.0.2:7070
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use nimbus::config::NimbusConfig;
use nimbus::fabric::{DiscoveryTopic, JoinOptions, PeerFabric, TcpDiscovery};
use nimbus::feed::{Feed, FeedPublicKey, FeedRegistry, FileStorage};
use nimbus::ledger::{InputFeed, Ledger, LedgerEvent};
use nimbus::sync::Replicator;

#[derive(Parser)]
#[command(name = "nimbus", version, about = "Verifiable feeds and convergent ledgers")]
struct Cli {
    /// JSON config file. Missing files fall back to defaults.
    #[arg(short, long, global = true, default_value = "nimbus.json")]
    config: PathBuf,

    /// Feed store directory (overrides `storage.root`).
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and write feeds in the store.
    Feed {
        #[command(subcommand)]
        action: FeedCommands,
    },

    /// Run a ledger node over TCP.
    Node {
        /// Topic shared by the peers of this ledger.
        #[arg(short, long)]
        topic: String,

        /// Address to accept peers on (overrides `fabric.listen_addr`).
        #[arg(short, long)]
        listen: Option<String>,

        /// Peer address to dial. Can be given several times.
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
}

#[derive(Subcommand)]
enum FeedCommands {
    /// Create a writable feed and print its key.
    Create,

    /// Append text, or a file split into chunks.
    Append {
        key: String,

        /// Entry payload as text.
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        data: Option<String>,

        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Chunk size in bytes when appending a file.
        #[arg(long, default_value = "65536")]
        chunk_size: usize,
    },

    /// Print one entry.
    Get {
        key: String,
        index: u64,

        /// Print the payload as hex instead of text.
        #[arg(long)]
        hex: bool,
    },

    /// Print the feed head.
    Head { key: String },

    /// Verify every entry and chain link.
    Audit { key: String },
}

/// Feeds a node keeps across restarts.
#[derive(Serialize, Deserialize)]
struct NodeState {
    writer: FeedPublicKey,
    output: FeedPublicKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = NimbusConfig::load_or_default(&cli.config).context("failed to load config")?;
    if let Some(store) = cli.store {
        config.storage.root = Some(store);
    }

    match cli.command {
        Commands::Feed { action } => cmd_feed(&config, action).await,
        Commands::Node {
            topic,
            listen,
            bootstrap,
        } => {
            if let Some(addr) = listen {
                config.fabric.listen_addr = addr;
            }
            if !bootstrap.is_empty() {
                config.fabric.bootstrap = bootstrap;
            }
            config.validate()?;
            cmd_node(config, &topic).await
        }
    }
}

fn open_registry(config: &NimbusConfig) -> Result<Arc<FeedRegistry>> {
    let root = config
        .storage
        .root
        .as_ref()
        .context("commands need a feed store; set --store or storage.root")?;
    let registry = FeedRegistry::with_root(root)
        .with_context(|| format!("failed to open store {}", root.display()))?;
    Ok(Arc::new(registry))
}

fn parse_key(s: &str) -> Result<FeedPublicKey> {
    FeedPublicKey::from_hex(s).with_context(|| format!("invalid feed key {}", s))
}

/// Open a feed we write, or else a mirror already in the store.
fn open_any(registry: &FeedRegistry, key: &FeedPublicKey) -> Result<Arc<dyn Feed>> {
    if let Ok(feed) = registry.open_local(key) {
        return Ok(feed as Arc<dyn Feed>);
    }
    let feeds_dir = registry.root().map(|root| root.join("feeds"));
    match feeds_dir {
        Some(dir) if FileStorage::feed_dir(&dir, key).exists() => {
            Ok(registry.open_mirror(*key)? as Arc<dyn Feed>)
        }
        _ => bail!("no feed {} in the store", key),
    }
}

// -----------------------------------------------------------------------
// nimbus feed
// -----------------------------------------------------------------------

async fn cmd_feed(config: &NimbusConfig, action: FeedCommands) -> Result<()> {
    let registry = open_registry(config)?;

    match action {
        FeedCommands::Create => {
            let feed = registry.create_local(None)?;
            println!("{}", feed.key().to_hex());
        }

        FeedCommands::Append {
            key,
            data,
            file,
            chunk_size,
        } => {
            let key = parse_key(&key)?;
            let feed = registry.open_local(&key).context("not a writable feed")?;
            if let Some(path) = file {
                let range = registry.distribute_file(&key, &path, chunk_size).await?;
                println!("appended {} at {}..{}", path.display(), range.start, range.end);
            } else if let Some(data) = data {
                let index = feed.append(data.into_bytes())?;
                println!("{}", index);
            }
            feed.close()?;
        }

        FeedCommands::Get { key, index, hex } => {
            let key = parse_key(&key)?;
            let payload = open_any(&registry, &key)?.get(index)?;
            if hex {
                println!("{}", hex::encode(payload));
            } else {
                println!("{}", String::from_utf8_lossy(&payload));
            }
        }

        FeedCommands::Head { key } => {
            let key = parse_key(&key)?;
            let head = open_any(&registry, &key)?.head();
            let out = serde_json::json!({
                "key": key.to_hex(),
                "length": head.length,
                "hash": hex::encode(head.hash),
                "root": hex::encode(head.root),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        FeedCommands::Audit { key } => {
            let key = parse_key(&key)?;
            let report = open_any(&registry, &key)?.audit();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(index) = report.first_invalid_index {
                bail!("feed {} fails verification at index {}", key.short(), index);
            }
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// nimbus node
// -----------------------------------------------------------------------

/// Reuse the node's writer and output feeds, creating them on first run.
fn open_node_state(registry: &FeedRegistry, root: &Path) -> Result<NodeState> {
    let path = root.join("node.json");
    if path.exists() {
        let data = std::fs::read(&path)?;
        return serde_json::from_slice(&data)
            .with_context(|| format!("corrupt node state {}", path.display()));
    }
    let state = NodeState {
        writer: registry.create_local(None)?.key(),
        output: registry.create_local(None)?.key(),
    };
    std::fs::write(&path, serde_json::to_vec_pretty(&state)?)?;
    Ok(state)
}

async fn cmd_node(config: NimbusConfig, topic: &str) -> Result<()> {
    let registry = open_registry(&config)?;
    let root = registry
        .root()
        .map(Path::to_path_buf)
        .context("node needs a feed store")?;
    let state = open_node_state(&registry, &root)?;

    let mut ledger = Ledger::new(config.ledger.clone());
    ledger.set_local_output(registry.open_local(&state.output)?)?;
    ledger.set_local_input(registry.open_local(&state.writer)?)?;
    // Writers merged in an earlier run come back from their mirrors on disk.
    let known: Vec<FeedPublicKey> = ledger
        .frontier_clock()
        .iter()
        .map(|(writer, _)| *writer)
        .filter(|writer| *writer != state.writer)
        .collect();
    for writer in known {
        ledger.register_input(InputFeed::Mirrored(registry.open_mirror(writer)?))?;
    }
    let mut events = ledger.subscribe();

    let discovery = Arc::new(TcpDiscovery::new(&config.fabric));
    let fabric = PeerFabric::new(discovery.clone(), config.fabric.event_capacity);
    let replicator =
        Replicator::with_registry(ledger, Arc::clone(&fabric), registry, config.sync.clone());

    fabric
        .join(&DiscoveryTopic::from(topic), JoinOptions::default())
        .await?;
    log::info!(
        "Node writer {} on topic {:?}{}",
        state.writer.short(),
        topic,
        discovery
            .local_addr()
            .map(|addr| format!(", listening on {}", addr))
            .unwrap_or_default()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    replicator.append_local(line.into_bytes()).await?;
                }
                None => stdin_open = false,
            },
            event = events.recv() => match event {
                Ok(LedgerEvent::EntryMerged { output_index, writer, .. }) => {
                    let payload = replicator.ledger().lock().await.get(output_index)?;
                    println!(
                        "[{}] {}: {}",
                        output_index,
                        writer.short(),
                        String::from_utf8_lossy(&payload)
                    );
                }
                Ok(LedgerEvent::WriterDiverged { writer, reason }) => {
                    log::warn!("Writer {} isolated: {}", writer.short(), reason);
                }
                Ok(LedgerEvent::WriterStalled { writer, held, known }) => {
                    log::warn!(
                        "Writer {} stalled at {}/{}; merging without it",
                        writer.short(),
                        held,
                        known
                    );
                }
                Ok(LedgerEvent::PeerConnected { peer }) => log::info!("Peer {} connected", peer),
                Ok(LedgerEvent::PeerDisconnected { peer }) => log::info!("Peer {} left", peer),
                Err(RecvError::Lagged(missed)) => log::warn!("Skipped {} ledger events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                log::info!("Shutting down");
                break;
            }
        }
    }

    replicator.close().await?;
    Ok(())
}
