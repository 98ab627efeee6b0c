use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::hex;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, info_span, Instrument};

use crate::automation::AutomationClient;
use crate::chain::{ChainClient, HeadStream, KeeperRegistry};
use crate::store::{EligibleUpkeep, KeeperStore, Registry};

const EXECUTION_QUEUE_SIZE: usize = 10;
const SELECTOR_LEN: usize = 4;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

// Covers the registry's own accounting overhead around performUpkeep.
const GAS_BUFFER: u64 = 200_000;

/// Block-driven upkeep evaluator.
///
/// A head-subscriber task records the latest block height and pokes a worker
/// task through a single-slot signal; the worker runs one evaluation round
/// per wake-up against the latest height, probing each eligible upkeep with
/// `checkUpkeep` and dispatching a job run for every hit.
pub struct UpkeepExecuter<C, S, A> {
    chain: C,
    store: S,
    automation: A,
    block_height: Arc<AtomicU64>,
    is_running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<C, S, A> UpkeepExecuter<C, S, A>
where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Clone + Send + Sync + 'static,
    A: AutomationClient + Clone + Send + Sync + 'static,
{
    pub fn new(chain: C, store: S, automation: A) -> Self {
        Self {
            chain,
            store,
            automation,
            block_height: Arc::new(AtomicU64::new(0)),
            is_running: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Opens the head subscription and spawns the subscriber and worker
    /// tasks. Errors if already started, or if the subscription cannot be
    /// opened — the latter is fatal for the process.
    pub async fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            bail!("already started");
        }

        let heads = match self.chain.subscribe_heads().await {
            Ok(heads) => heads,
            Err(err) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(err).context("Failed to open head subscription");
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

        let subscriber = tokio::spawn(
            run_head_subscriber(
                self.chain.clone(),
                heads,
                self.block_height.clone(),
                signal_tx,
                stop_rx.clone(),
            )
            .instrument(info_span!("head_subscriber")),
        );
        let worker = tokio::spawn(
            run_worker(
                self.chain.clone(),
                self.store.clone(),
                self.automation.clone(),
                self.block_height.clone(),
                signal_rx,
                stop_rx,
            )
            .instrument(info_span!("upkeep_worker")),
        );

        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        *self.handles.lock().unwrap() = vec![subscriber, worker];
        Ok(())
    }

    /// Stops both tasks. In-flight probes run on detached tasks and are
    /// abandoned; a trigger that already started is allowed to complete.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap().take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        self.is_running.store(false, Ordering::SeqCst);
    }
}

async fn run_head_subscriber<C>(
    chain: C,
    mut heads: HeadStream,
    block_height: Arc<AtomicU64>,
    signal_tx: mpsc::Sender<()>,
    mut stop_rx: watch::Receiver<bool>,
) where
    C: ChainClient + Send + Sync,
{
    let mut resub_stop = stop_rx.clone();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            head = heads.next() => match head {
                Some(number) => {
                    // store the height before posting the signal so the
                    // worker always evaluates against the latest head
                    block_height.store(number, Ordering::SeqCst);
                    // a full buffer means a run is already pending; heads
                    // coalesce
                    let _ = signal_tx.try_send(());
                }
                None => {
                    error!("head subscription ended, resubscribing");
                    tokio::select! {
                        _ = resub_stop.changed() => return,
                        () = sleep(RESUBSCRIBE_DELAY) => {}
                    }
                    match chain.subscribe_heads().await {
                        Ok(stream) => heads = stream,
                        Err(err) => error!(?err, "unable to reopen head subscription"),
                    }
                }
            },
        }
    }
}

async fn run_worker<C, S, A>(
    chain: C,
    store: S,
    automation: A,
    block_height: Arc<AtomicU64>,
    mut signal_rx: mpsc::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
) where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Send + Sync,
    A: AutomationClient + Clone + Send + Sync + 'static,
{
    let queue = Arc::new(Semaphore::new(EXECUTION_QUEUE_SIZE));
    let mut round_stop = stop_rx.clone();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            signal = signal_rx.recv() => {
                if signal.is_none() {
                    return;
                }
                let height = block_height.load(Ordering::SeqCst);
                run_evaluation_round(&chain, &store, &automation, height, &queue, &mut round_stop)
                    .await;
            }
        }
    }
}

async fn run_evaluation_round<C, S, A>(
    chain: &C,
    store: &S,
    automation: &A,
    block_number: u64,
    queue: &Arc<Semaphore>,
    stop_rx: &mut watch::Receiver<bool>,
) where
    C: ChainClient + Clone + Send + Sync + 'static,
    S: KeeperStore + Send + Sync,
    A: AutomationClient + Clone + Send + Sync + 'static,
{
    debug!(block = block_number, "running checkUpkeep for eligible upkeeps");

    let eligible = match store.eligible_upkeeps(block_number).await {
        Ok(eligible) => eligible,
        Err(err) => {
            error!(?err, "unable to load eligible upkeeps");
            return;
        }
    };

    for entry in eligible {
        // blocks when the queue is full, providing backpressure within the
        // round; a stop must not wait behind in-flight probes
        let permit = tokio::select! {
            _ = stop_rx.changed() => return,
            permit = queue.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let chain = chain.clone();
        let automation = automation.clone();
        tokio::spawn(async move {
            let _permit = permit;
            probe_and_trigger(&chain, &automation, entry).await;
        });
    }
}

/// Probes one upkeep with `checkUpkeep` and, if the probe succeeds, triggers
/// the registry's job on the automation node.
async fn probe_and_trigger<C, A>(chain: &C, automation: &A, entry: EligibleUpkeep)
where
    C: ChainClient + Send + Sync,
    A: AutomationClient + Send + Sync,
{
    let registry = &entry.registry;
    let upkeep = &entry.upkeep;

    let check_calldata = KeeperRegistry::checkUpkeepCall {
        id: U256::from(upkeep.upkeep_id),
        from: registry.from,
    }
    .abi_encode();

    let tx = TransactionRequest::default()
        .with_from(Address::ZERO)
        .with_to(registry.address)
        .with_gas_limit(registry.check_gas as u64)
        .with_input(check_calldata);

    debug!(registry = %registry.address, upkeep = upkeep.upkeep_id, "checking upkeep");

    let result = match chain.call(tx).await {
        Ok(result) => result,
        Err(err) => {
            // expected negative case: the upkeep does not need to fire
            debug!(
                registry = %registry.address,
                upkeep = upkeep.upkeep_id,
                ?err,
                "checkUpkeep failed"
            );
            return;
        }
    };

    let decoded = match KeeperRegistry::checkUpkeepCall::abi_decode_returns(&result) {
        Ok(decoded) => decoded,
        Err(err) => {
            error!(
                registry = %registry.address,
                upkeep = upkeep.upkeep_id,
                ?err,
                "unable to decode checkUpkeep result"
            );
            return;
        }
    };

    let payload = trigger_payload(registry, upkeep.upkeep_id, upkeep.execute_gas, &decoded.performData);

    info!(registry = %registry.address, upkeep = upkeep.upkeep_id, "performing upkeep");
    if let Err(err) = automation.trigger_job(registry.job_id, &payload).await {
        error!(?err, "unable to trigger job on automation node");
    }
}

/// Job-run payload handed to the automation node: the `performUpkeep`
/// calldata with its 4-byte selector stripped, plus enough context for the
/// node to submit the transaction itself.
pub fn trigger_payload(
    registry: &Registry,
    upkeep_id: u64,
    execute_gas: u32,
    perform_data: &[u8],
) -> Value {
    let perform_calldata = KeeperRegistry::performUpkeepCall {
        id: U256::from(upkeep_id),
        performData: perform_data.to_vec().into(),
    }
    .abi_encode();

    json!({
        "format": "preformatted",
        "address": registry.address.to_checksum(None),
        "functionSelector": hex::encode_prefixed(KeeperRegistry::performUpkeepCall::SELECTOR),
        "result": hex::encode_prefixed(&perform_calldata[SELECTOR_LEN..]),
        "fromAddresses": [registry.from.to_checksum(None)],
        "gasLimit": execute_gas as u64 + GAS_BUFFER,
    })
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{keccak256, Bytes, U256};
    use alloy::sol_types::{SolCall, SolValue};
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::test::{test_registration, test_registry, MemoryStore, TestAutomation, TestChain};

    fn checkupkeep_return_data(perform_data: &[u8]) -> Bytes {
        (
            Bytes::from(perform_data.to_vec()),
            U256::ZERO,
            U256::from(2_000_000u64),
            U256::ZERO,
            U256::ZERO,
        )
            .abi_encode_params()
            .into()
    }

    async fn seeded_store() -> (MemoryStore, Registry) {
        let store = MemoryStore::default();
        let mut registry = test_registry(Address::repeat_byte(0x23), Address::repeat_byte(0xab));
        registry.check_gas = 2_000_000;
        registry.block_count_per_turn = 20;
        registry.keeper_index = 0;
        registry.num_keepers = 1;
        let registry = store.upsert_registry(&registry).await.unwrap();
        store
            .upsert_upkeep(&test_registration(registry.id, 0))
            .await
            .unwrap();
        (store, registry)
    }

    #[tokio::test]
    async fn errors_if_started_twice() {
        let (automation, _triggered) = TestAutomation::new();
        let chain = TestChain::default();
        let _heads = chain.head_sender();
        let (store, _registry) = seeded_store().await;

        let executer = UpkeepExecuter::new(chain, store, automation);
        executer.start().await.unwrap();
        assert!(executer.start().await.is_err());
        executer.stop().await;
    }

    #[tokio::test]
    async fn performs_upkeep_on_triggering_block() {
        let (automation, mut triggered) = TestAutomation::new();
        let chain = TestChain::default();
        let heads = chain.head_sender();
        let (store, registry) = seeded_store().await;

        chain.push_call_result(Ok(checkupkeep_return_data(&[0x12, 0x34])));

        let executer = UpkeepExecuter::new(chain.clone(), store, automation.clone());
        executer.start().await.unwrap();

        heads.send(20).await.unwrap();
        timeout(Duration::from_secs(2), triggered.recv())
            .await
            .expect("job run never triggered");

        let triggers = automation.triggers();
        assert_eq!(triggers.len(), 1);
        let (job_id, payload) = &triggers[0];
        assert_eq!(*job_id, registry.job_id);

        assert_eq!(payload["format"], "preformatted");
        assert_eq!(payload["address"], registry.address.to_checksum(None));
        assert_eq!(payload["fromAddresses"][0], registry.from.to_checksum(None));
        assert_eq!(payload["gasLimit"], 10_000 + 200_000);

        let expected_selector =
            hex::encode_prefixed(&keccak256("performUpkeep(uint256,bytes)")[..SELECTOR_LEN]);
        assert_eq!(payload["functionSelector"], expected_selector);

        // the result field is the performUpkeep calldata minus the selector
        let result = hex::decode(payload["result"].as_str().unwrap()).unwrap();
        let mut calldata = KeeperRegistry::performUpkeepCall::SELECTOR.to_vec();
        calldata.extend_from_slice(&result);
        let decoded = KeeperRegistry::performUpkeepCall::abi_decode(&calldata).unwrap();
        assert_eq!(decoded.id, U256::ZERO);
        assert_eq!(decoded.performData, Bytes::from(vec![0x12, 0x34]));

        // gas-limited probe from the zero address against the registry
        let calls = chain.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].from, Some(Address::ZERO));
        assert_eq!(calls[0].gas, Some(2_000_000));

        executer.stop().await;
    }

    #[tokio::test]
    async fn skips_upkeep_on_non_triggering_block() {
        let (automation, mut triggered) = TestAutomation::new();
        let chain = TestChain::default();
        let heads = chain.head_sender();
        let (store, _registry) = seeded_store().await;

        let executer = UpkeepExecuter::new(chain.clone(), store, automation.clone());
        executer.start().await.unwrap();

        heads.send(21).await.unwrap();
        assert!(
            timeout(Duration::from_millis(500), triggered.recv())
                .await
                .is_err(),
            "job was not supposed to run"
        );
        assert!(chain.calls().is_empty());
        assert!(automation.triggers().is_empty());

        executer.stop().await;
    }

    #[tokio::test]
    async fn does_not_trigger_when_probe_fails() {
        let (automation, mut triggered) = TestAutomation::new();
        let chain = TestChain::default();
        let heads = chain.head_sender();
        let mut probed = chain.call_watcher();
        let (store, _registry) = seeded_store().await;

        chain.push_call_result(Err("execution reverted".to_string()));

        let executer = UpkeepExecuter::new(chain.clone(), store, automation.clone());
        executer.start().await.unwrap();

        heads.send(20).await.unwrap();
        timeout(Duration::from_secs(2), probed.recv())
            .await
            .expect("checkUpkeep never called");
        assert!(
            timeout(Duration::from_millis(500), triggered.recv())
                .await
                .is_err(),
            "job was not supposed to run"
        );
        assert!(automation.triggers().is_empty());

        executer.stop().await;
    }

    #[tokio::test]
    async fn coalesces_heads_to_latest_height() {
        let (automation, mut triggered) = TestAutomation::new();
        let chain = TestChain::default();
        let heads = chain.head_sender();
        let (store, _registry) = seeded_store().await;

        // two turn boundaries in quick succession; at most two rounds run and
        // the later one evaluates the latest height
        chain.push_call_result(Ok(checkupkeep_return_data(&[0x01])));
        chain.push_call_result(Ok(checkupkeep_return_data(&[0x01])));

        let executer = UpkeepExecuter::new(chain.clone(), store, automation.clone());
        executer.start().await.unwrap();

        heads.send(20).await.unwrap();
        heads.send(40).await.unwrap();

        timeout(Duration::from_secs(2), triggered.recv())
            .await
            .expect("job run never triggered");

        executer.stop().await;
        assert!(!automation.triggers().is_empty());
    }
}
