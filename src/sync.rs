use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info_span, Instrument};

use crate::chain::ChainClient;
use crate::store::{calc_positioning_constant, KeeperStore, Registration, Registry};

// max in-flight chain work is a product of these two bounds
const SYNC_REGISTRY_CONCURRENCY: usize = 3;
const SYNC_UPKEEP_CONCURRENCY: usize = 10;

/// Periodic reconciler of on-chain registry state into the keeper store.
///
/// Each pass refreshes config and keeper membership for every known
/// registry, inserts newly registered upkeeps and deletes cancelled ones.
/// A registry that fails to sync is abandoned for the pass and retried on
/// the next tick.
pub struct RegistrySynchronizer<C, S> {
    chain: C,
    store: S,
    sync_interval: Duration,
    is_running: Arc<AtomicBool>,
    is_syncing: Arc<AtomicBool>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C, S> RegistrySynchronizer<C, S>
where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Clone + Send + Sync + 'static,
{
    pub fn new(chain: C, store: S, sync_interval: Duration) -> Self {
        Self {
            chain,
            store,
            sync_interval,
            is_running: Arc::new(AtomicBool::new(false)),
            is_syncing: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the sync loop. Errors if already started.
    pub fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            bail!("already started");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            run_sync_loop(
                self.chain.clone(),
                self.store.clone(),
                self.is_syncing.clone(),
                self.sync_interval,
                stop_rx,
            )
            .instrument(info_span!("registry_sync")),
        );

        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Signals the loop to terminate and waits for any in-flight sync pass
    /// to finish.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap().take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Runs one full sync pass over every known registry, blocking until it
    /// completes.
    pub async fn perform_full_sync(&self) {
        perform_full_sync(&self.chain, &self.store).await;
    }
}

async fn run_sync_loop<C, S>(
    chain: C,
    store: S,
    is_syncing: Arc<AtomicBool>,
    sync_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Clone + Send + Sync + 'static,
{
    // ticks that land while a pass is still running are dropped
    let mut ticker = interval_at(Instant::now() + sync_interval, sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {
                if is_syncing.swap(true, Ordering::SeqCst) {
                    continue;
                }
                perform_full_sync(&chain, &store).await;
                is_syncing.store(false, Ordering::SeqCst);
            }
        }
    }
}

async fn perform_full_sync<C, S>(chain: &C, store: &S)
where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Clone + Send + Sync + 'static,
{
    debug!("performing full sync of all keeper registries");

    let registries = match store.registries().await {
        Ok(registries) => registries,
        Err(err) => {
            error!(?err, "unable to load registries");
            return;
        }
    };

    let queue = Arc::new(Semaphore::new(SYNC_REGISTRY_CONCURRENCY));
    let mut passes = JoinSet::new();
    for registry in registries {
        let Ok(permit) = queue.clone().acquire_owned().await else {
            return;
        };
        let chain = chain.clone();
        let store = store.clone();
        let address = registry.address;
        passes.spawn(
            async move {
                let _permit = permit;
                if let Err(err) = sync_registry(&chain, &store, registry).await {
                    error!(registry = %address, ?err, "unable to sync registry");
                }
            }
            .instrument(info_span!("sync_registry", registry = %address)),
        );
    }
    while passes.join_next().await.is_some() {}
}

async fn sync_registry<C, S>(chain: &C, store: &S, mut registry: Registry) -> Result<()>
where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Clone + Send + Sync + 'static,
{
    debug!("syncing registry");

    let config = chain
        .registry_config(registry.address)
        .await
        .context("Failed to load registry config")?;
    registry.check_gas = config.check_gas_limit;
    registry.block_count_per_turn = config.block_count_per_turn;

    let keepers = chain
        .keeper_list(registry.address)
        .await
        .context("Failed to load keeper list")?;
    let keeper_index = keepers
        .iter()
        .position(|keeper| *keeper == registry.from)
        .ok_or_else(|| {
            anyhow!(
                "unable to find {} in keeper list on registry {}",
                registry.from,
                registry.address
            )
        })?;
    registry.keeper_index = u32::try_from(keeper_index).context("keeper index out of range")?;
    registry.num_keepers = u32::try_from(keepers.len()).context("keeper list length out of range")?;

    let registry = store
        .upsert_registry(&registry)
        .await
        .context("Failed to upsert registry")?;

    add_new_upkeeps(chain, store, &registry).await?;
    delete_canceled_upkeeps(chain, store, &registry).await?;
    Ok(())
}

async fn add_new_upkeeps<C, S>(chain: &C, store: &S, registry: &Registry) -> Result<()>
where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Clone + Send + Sync + 'static,
{
    let next_upkeep_id = store
        .next_upkeep_id(registry)
        .await
        .context("Failed to load next upkeep id")?;
    let count_on_chain = chain
        .upkeep_count(registry.address)
        .await
        .context("Failed to load upkeep count")?;

    if next_upkeep_id >= count_on_chain {
        return Ok(());
    }
    debug!(
        from = next_upkeep_id,
        to = count_on_chain,
        "syncing new upkeeps"
    );

    let queue = Arc::new(Semaphore::new(SYNC_UPKEEP_CONCURRENCY));
    let mut fetches = JoinSet::new();
    for upkeep_id in next_upkeep_id..count_on_chain {
        let Ok(permit) = queue.clone().acquire_owned().await else {
            break;
        };
        let chain = chain.clone();
        let store = store.clone();
        let registry = registry.clone();
        fetches.spawn(async move {
            let _permit = permit;
            if let Err(err) = sync_upkeep(&chain, &store, &registry, upkeep_id).await {
                error!(upkeep = upkeep_id, ?err, "unable to sync upkeep");
            }
        });
    }
    while fetches.join_next().await.is_some() {}
    Ok(())
}

async fn sync_upkeep<C, S>(chain: &C, store: &S, registry: &Registry, upkeep_id: u64) -> Result<()>
where
    C: ChainClient + Send + Sync,
    S: KeeperStore + Send + Sync,
{
    let info = chain
        .upkeep(registry.address, upkeep_id)
        .await
        .context("Failed to fetch upkeep")?;
    let positioning_constant =
        calc_positioning_constant(upkeep_id, registry.address, registry.num_keepers)
            .context("unable to calculate positioning constant")?;

    let upkeep = Registration {
        id: 0,
        registry_id: registry.id,
        upkeep_id,
        execute_gas: info.execute_gas,
        check_data: info.check_data,
        positioning_constant,
    };

    store
        .upsert_upkeep(&upkeep)
        .await
        .context("Failed to upsert upkeep")
}

async fn delete_canceled_upkeeps<C, S>(chain: &C, store: &S, registry: &Registry) -> Result<()>
where
    C: ChainClient + Send + Sync,
    S: KeeperStore + Send + Sync,
{
    let canceled = chain
        .canceled_upkeep_list(registry.address)
        .await
        .context("Failed to load cancelled upkeep list")?;
    if canceled.is_empty() {
        return Ok(());
    }

    let deleted = store
        .batch_delete_upkeeps(registry.id, &canceled)
        .await
        .context("Failed to delete cancelled upkeeps")?;
    if deleted > 0 {
        debug!(deleted, "deleted cancelled upkeeps");
    }
    Ok(())
}
