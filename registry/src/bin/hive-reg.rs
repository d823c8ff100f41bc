// Runs a few hives against one in-memory coordination store and walks them
// through membership and shard ownership. Useful to watch the registry logs:
//
//     RUST_LOG=registry=debug cargo run --bin hive-reg

use anyhow::{bail, Context, Result};
use registry::{
    store::CoordStore, BeeId, ChannelContext, ClusterEvent, DictKey, FatalHandler, HiveId,
    MemStore, Registry, RegistryConfig, ShardGroup,
};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const APP: &str = "kv";

struct Hive {
    id: HiveId,
    registry: Registry,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
}

async fn start_hive(
    config: &RegistryConfig,
    store: &Arc<MemStore>,
    id: HiveId,
) -> Result<Hive> {
    let (ctx, events) = ChannelContext::new(id.clone());
    let shared: Arc<dyn CoordStore> = store.clone();
    let registry = Registry::connect(config, Arc::new(ctx), FatalHandler::default(), move |_| shared)
        .await
        .with_context(|| format!("hive {id} cannot join the registry"))?
        .context("registry is disabled")?;

    info!(hive = %id, "hive started");
    Ok(Hive {
        id,
        registry,
        events,
    })
}

/// Number of demo hives: `BH_DEMO_HIVES`, default 3. The demo needs one.
fn hive_count(var: Option<&str>) -> Result<usize> {
    let count = match var {
        Some(n) => n
            .trim()
            .parse::<usize>()
            .with_context(|| format!("BH_DEMO_HIVES={n:?} is not a number"))?,
        None => 3,
    };
    if count == 0 {
        bail!("BH_DEMO_HIVES must be at least 1");
    }
    Ok(count)
}

fn drain_events(hive: &mut Hive) {
    while let Ok(event) = hive.events.try_recv() {
        info!(hive = %hive.id, kind = ?event.kind(), peer = %event.hive(), "cluster event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RegistryConfig::from_env()?;
    if !config.is_enabled() {
        config.addrs = vec!["mem://local".to_string()];
    }
    let count = hive_count(env::var("BH_DEMO_HIVES").ok().as_deref())?;

    info!(prefix = %config.prefix, hive_ttl = ?config.hive_ttl, count, "hive-reg starting");

    let store = Arc::new(MemStore::new());
    let mut hives = Vec::with_capacity(count);
    for _ in 0..count {
        hives.push(start_hive(&config, &store, HiveId::random()).await?);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for hive in &mut hives {
        drain_events(hive);
    }

    let group = ShardGroup::new(vec![DictKey::new("d1", "k1"), DictKey::new("d1", "k2")]);
    let first = BeeId::new(hives[0].id.clone(), APP, 1);
    let owner = hives[0].registry.set(&first, &group).await?;
    info!(%owner, "group assigned");

    for (i, hive) in hives.iter().enumerate().skip(1) {
        let bee = BeeId::new(hive.id.clone(), APP, i as u64 + 1);
        match hive.registry.store_or_get(&bee, &group).await {
            Ok(found) if found == owner => info!(%bee, %found, "competing claim resolved to owner"),
            Ok(found) => error!(%bee, %found, %owner, "competing claim disagrees with owner"),
            Err(e) => error!(%bee, error = %e, "competing claim failed"),
        }
    }

    for hive in hives.iter_mut().rev() {
        hive.registry.disconnect().await?;
        info!(hive = %hive.id, "hive stopped");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for hive in &mut hives {
        drain_events(hive);
    }

    info!("hive-reg done");
    Ok(())
}
