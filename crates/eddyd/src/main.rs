//! `eddyd` — the eddy ring daemon.
//!
//! Builds an in-memory ring of shards from configuration and runs
//! non-interactive diagnostics against it.
//!
//! # Usage
//!
//! ```text
//! eddyd ring                       # show vnode layout and key placement
//! eddyd ring -c eddy.toml          # same, with a config file
//! eddyd route user:1001 order:9876 # show where keys land
//! eddyd demo -n 5000               # join, fail, evict, and verify keys
//! eddyd demo --hard                # fail a shard whose data is unreachable
//! VERBOSE_LOGGING_ENABLED=true eddyd demo
//! ```

mod cluster;
mod config;
mod telemetry;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use eddy_cluster::{RebalanceReport, RingManager, membership};
use eddy_placement::key_hash;
use eddy_types::{RingEvent, ShardId, shard_id_for};
use tokio::sync::broadcast;
use tracing::{info, warn};

use cluster::LocalCluster;
use config::CliConfig;

/// Keys used to show how the default ring spreads load.
const SAMPLE_KEYS: &[&str] = &[
    "user:1001",
    "product:5432",
    "session:abc123",
    "order:9876",
    "comment:45678",
    "post:1234",
];

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "eddyd", version, about = "Consistent-hashing shard ring daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log every routing decision at info level.
    #[arg(long, global = true, env = "VERBOSE_LOGGING_ENABLED")]
    verbose_routing: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print virtual-node positions, ownership, and sample key placement.
    Ring,

    /// Print the hash and owning shard of each key.
    Route {
        /// Keys to route.
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Write keys, join a shard, fail one, and check nothing was lost.
    Demo {
        /// Number of keys to write.
        #[arg(short = 'n', long, default_value = "1000")]
        keys: usize,

        /// Take the failed shard fully down instead of failing only its
        /// health pings. Its keys cannot be migrated off and are lost.
        #[arg(long)]
        hard: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if cli.verbose_routing {
        config.ring.verbose_routing = true;
    }

    telemetry::init(&config.log.level, config.ring.verbose_routing);

    match cli.command {
        Commands::Ring => cmd_ring(&config).await,
        Commands::Route { keys } => cmd_route(&config, &keys).await,
        Commands::Demo { keys, hard } => cmd_demo(&config, keys, hard).await,
    }
}

// -----------------------------------------------------------------------
// ring / route
// -----------------------------------------------------------------------

async fn cmd_ring(config: &CliConfig) -> Result<()> {
    let cluster = LocalCluster::bootstrap(config)?;
    let manager = &cluster.manager;

    println!("eddy ring");
    println!("  shards:           {}", manager.shard_count().await);
    println!("  vnodes per shard: {}", config.vnodes_per_shard());
    println!();

    println!("Virtual nodes:");
    for vnode in manager.snapshot().await {
        println!(
            "  {:#010x}  {:<28} -> {}",
            vnode.position, vnode.vnode_id, vnode.shard_id
        );
    }
    println!();

    print_ownership(manager).await;
    println!();

    println!("Sample keys:");
    for key in SAMPLE_KEYS {
        print_route(manager, key).await;
    }

    Ok(())
}

async fn cmd_route(config: &CliConfig, keys: &[String]) -> Result<()> {
    let cluster = LocalCluster::bootstrap(config)?;
    for key in keys {
        print_route(&cluster.manager, key).await;
    }
    Ok(())
}

async fn print_ownership(manager: &RingManager) {
    println!("Ownership:");
    for (shard_id, share) in manager.ownership().await {
        println!("  {shard_id:<16} {:>6.2}%", share * 100.0);
    }
}

async fn print_route(manager: &RingManager, key: &str) {
    let owner = manager
        .route(key)
        .await
        .map_or_else(|| "<none>".to_string(), |id| id.to_string());
    println!("  {key:<16} {:#010x} -> {owner}", key_hash(key));
}

// -----------------------------------------------------------------------
// demo
// -----------------------------------------------------------------------

async fn cmd_demo(config: &CliConfig, count: usize, hard: bool) -> Result<()> {
    let mut cluster = LocalCluster::bootstrap(config)?;
    let manager = cluster.manager.clone();
    let membership_config = config.membership_config();

    println!("eddy demo");
    println!("  keys:      {count}");
    println!("  shards:    {}", manager.shard_count().await);
    println!(
        "  probe:     every {}ms, evict after {} failures",
        membership_config.probe_interval.as_millis(),
        membership_config.failure_threshold
    );
    println!();

    // --- Write ---
    print!("Writing {count} keys... ");
    let start = Instant::now();
    let mut rejected = 0usize;
    for i in 0..count {
        if !manager.set(&demo_key(i), demo_value(i)).await {
            rejected += 1;
        }
    }
    println!("{:.2}s ({rejected} rejected)", start.elapsed().as_secs_f64());

    // --- Join ---
    let joiner = next_shard_id(&cluster);
    let store = cluster.add_store(config, &joiner);
    print!("Joining {joiner}... ");
    let report = manager
        .join(joiner.clone(), store)
        .await
        .context("join failed")?;
    println!("{}", describe(&report));

    // --- Fail ---
    let Some(victim) = manager.route(SAMPLE_KEYS[0]).await else {
        bail!("ring has no active shard");
    };
    let victim_store = cluster
        .stores
        .get(&victim)
        .with_context(|| format!("no store for {victim}"))?
        .clone();
    if hard {
        println!("Taking {victim} down...");
        victim_store.set_down(true);
    } else {
        println!("Failing health pings of {victim}...");
        victim_store.fail_pings(true);
    }

    let mut events = manager.subscribe();
    let handle = membership::start(manager.clone(), membership_config.clone());
    let deadline = membership_config.probe_interval
        * (membership_config.failure_threshold + 2)
        + Duration::from_secs(5);

    print!("Waiting for eviction... ");
    let start = Instant::now();
    let evicted = tokio::time::timeout(deadline, wait_for_leave(&mut events, &victim)).await;
    handle.shutdown();
    match evicted {
        Ok(Ok(())) => println!("{:.2}s", start.elapsed().as_secs_f64()),
        Ok(Err(e)) => bail!("event stream closed: {e}"),
        Err(_) => bail!("{victim} was not evicted within {}ms", deadline.as_millis()),
    }

    // --- Verify ---
    print!("Reading {count} keys... ");
    let mut missing = 0usize;
    for i in 0..count {
        if manager.get(&demo_key(i)).await.as_ref() != Some(&demo_value(i)) {
            missing += 1;
        }
    }
    println!("done");

    println!();
    println!("Summary:");
    println!("  Shards now:   {}", manager.shard_count().await);
    println!("  Keys written: {}", count - rejected);
    println!("  Keys missing: {missing}");
    print_ownership(&manager).await;

    if missing > 0 {
        if hard {
            warn!(missing, "keys on the failed shard were not migrated");
        } else {
            bail!("{missing} keys were lost");
        }
    } else {
        info!("every key survived the join and eviction");
    }

    Ok(())
}

fn demo_key(i: usize) -> String {
    format!("key:{i}")
}

fn demo_value(i: usize) -> Bytes {
    Bytes::from(format!("value-{i}"))
}

/// First `cache-node-<i>` name not already in use.
fn next_shard_id(cluster: &LocalCluster) -> ShardId {
    (0..=u16::MAX)
        .map(shard_id_for)
        .find(|id| !cluster.stores.contains_key(id))
        .unwrap_or_else(|| ShardId::from("cache-node-extra"))
}

async fn wait_for_leave(
    events: &mut broadcast::Receiver<RingEvent>,
    shard_id: &ShardId,
) -> Result<(), broadcast::error::RecvError> {
    loop {
        match events.recv().await {
            Ok(RingEvent::ShardLeft(id)) if &id == shard_id => return Ok(()),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(e) => return Err(e),
        }
    }
}

fn describe(report: &RebalanceReport) -> String {
    let failed = report
        .migrations
        .iter()
        .filter(|m| m.result.is_err())
        .count();
    format!(
        "{} vnodes, {} keys moved in {} migrations ({failed} failed)",
        report.vnodes,
        report.keys_moved(),
        report.migrations.len()
    )
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
