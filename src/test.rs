use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::TransactionRequest;
use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::automation::AutomationClient;
use crate::chain::{ChainClient, HeadStream, RegistryConfig, UpkeepInfo};
use crate::store::{EligibleUpkeep, KeeperStore, Registration, Registry};

pub fn test_registry(address: Address, from: Address) -> Registry {
    Registry::new(address, from, Uuid::new_v4())
}

pub fn test_registration(registry_id: i64, upkeep_id: u64) -> Registration {
    Registration {
        id: 0,
        registry_id,
        upkeep_id,
        execute_gas: 10_000,
        check_data: vec![0x12, 0x34],
        positioning_constant: 0,
    }
}

/// In-memory store mirroring the Postgres upsert and cascade semantics.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

#[derive(Default)]
struct MemoryStoreState {
    registries: Vec<Registry>,
    upkeeps: Vec<Registration>,
    next_registry_id: i64,
    next_registration_id: i64,
}

impl MemoryStore {
    pub fn upkeeps(&self) -> Vec<Registration> {
        self.state.lock().unwrap().upkeeps.clone()
    }
}

impl KeeperStore for MemoryStore {
    async fn registries(&self) -> Result<Vec<Registry>> {
        Ok(self.state.lock().unwrap().registries.clone())
    }

    async fn create_registry(&self, registry: &Registry) -> Result<Registry> {
        let mut state = self.state.lock().unwrap();
        if state
            .registries
            .iter()
            .any(|existing| existing.address == registry.address)
        {
            bail!("registry {} is already registered", registry.address);
        }

        state.next_registry_id += 1;
        let stored = Registry {
            id: state.next_registry_id,
            ..registry.clone()
        };
        state.registries.push(stored.clone());
        Ok(stored)
    }

    async fn upsert_registry(&self, registry: &Registry) -> Result<Registry> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .registries
            .iter_mut()
            .find(|existing| existing.address == registry.address)
        {
            existing.check_gas = registry.check_gas;
            existing.block_count_per_turn = registry.block_count_per_turn;
            existing.keeper_index = registry.keeper_index;
            existing.num_keepers = registry.num_keepers;
            return Ok(existing.clone());
        }

        state.next_registry_id += 1;
        let stored = Registry {
            id: state.next_registry_id,
            ..registry.clone()
        };
        state.registries.push(stored.clone());
        Ok(stored)
    }

    async fn delete_registry_by_job_id(&self, job_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let removed: Vec<i64> = state
            .registries
            .iter()
            .filter(|registry| registry.job_id == job_id)
            .map(|registry| registry.id)
            .collect();
        state.registries.retain(|registry| registry.job_id != job_id);
        state
            .upkeeps
            .retain(|upkeep| !removed.contains(&upkeep.registry_id));
        Ok(removed.len() as u64)
    }

    async fn upsert_upkeep(&self, upkeep: &Registration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.upkeeps.iter_mut().find(|existing| {
            existing.registry_id == upkeep.registry_id && existing.upkeep_id == upkeep.upkeep_id
        }) {
            existing.execute_gas = upkeep.execute_gas;
            existing.check_data = upkeep.check_data.clone();
            return Ok(());
        }

        state.next_registration_id += 1;
        let stored = Registration {
            id: state.next_registration_id,
            ..upkeep.clone()
        };
        state.upkeeps.push(stored);
        Ok(())
    }

    async fn batch_delete_upkeeps(&self, registry_id: i64, upkeep_ids: &[u64]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.upkeeps.len();
        state.upkeeps.retain(|upkeep| {
            upkeep.registry_id != registry_id || !upkeep_ids.contains(&upkeep.upkeep_id)
        });
        Ok((before - state.upkeeps.len()) as u64)
    }

    async fn next_upkeep_id(&self, registry: &Registry) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .upkeeps
            .iter()
            .filter(|upkeep| upkeep.registry_id == registry.id)
            .map(|upkeep| upkeep.upkeep_id + 1)
            .max()
            .unwrap_or(0))
    }

    async fn eligible_upkeeps(&self, block_number: u64) -> Result<Vec<EligibleUpkeep>> {
        let state = self.state.lock().unwrap();
        let mut eligible = Vec::new();
        for upkeep in &state.upkeeps {
            let Some(registry) = state
                .registries
                .iter()
                .find(|registry| registry.id == upkeep.registry_id)
            else {
                continue;
            };
            if upkeep.eligible_at(registry, block_number) {
                eligible.push(EligibleUpkeep {
                    upkeep: upkeep.clone(),
                    registry: registry.clone(),
                });
            }
        }
        Ok(eligible)
    }
}

/// Scriptable chain double: registry state is set per address, `eth_call`
/// results are consumed in order and every call is recorded.
#[derive(Clone, Default)]
pub struct TestChain {
    state: Arc<Mutex<TestChainState>>,
}

#[derive(Default)]
struct TestChainState {
    configs: HashMap<Address, RegistryConfig>,
    keeper_lists: HashMap<Address, Vec<Address>>,
    upkeep_counts: HashMap<Address, u64>,
    upkeeps: HashMap<(Address, u64), UpkeepInfo>,
    canceled: HashMap<Address, Vec<u64>>,
    call_results: VecDeque<Result<Bytes, String>>,
    calls: Vec<TransactionRequest>,
    heads_rx: Option<mpsc::Receiver<u64>>,
    call_notify: Option<mpsc::UnboundedSender<()>>,
}

impl TestChain {
    pub fn set_config(&self, registry: Address, config: RegistryConfig) {
        self.state.lock().unwrap().configs.insert(registry, config);
    }

    pub fn set_keeper_list(&self, registry: Address, keepers: Vec<Address>) {
        self.state
            .lock()
            .unwrap()
            .keeper_lists
            .insert(registry, keepers);
    }

    pub fn set_upkeep_count(&self, registry: Address, count: u64) {
        self.state
            .lock()
            .unwrap()
            .upkeep_counts
            .insert(registry, count);
    }

    pub fn set_upkeep(&self, registry: Address, upkeep_id: u64, info: UpkeepInfo) {
        self.state
            .lock()
            .unwrap()
            .upkeeps
            .insert((registry, upkeep_id), info);
    }

    pub fn set_canceled(&self, registry: Address, upkeep_ids: Vec<u64>) {
        self.state
            .lock()
            .unwrap()
            .canceled
            .insert(registry, upkeep_ids);
    }

    pub fn push_call_result(&self, result: Result<Bytes, String>) {
        self.state.lock().unwrap().call_results.push_back(result);
    }

    pub fn calls(&self) -> Vec<TransactionRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Returns a sender feeding the head subscription handed out by
    /// `subscribe_heads`.
    pub fn head_sender(&self) -> mpsc::Sender<u64> {
        let (tx, rx) = mpsc::channel(16);
        self.state.lock().unwrap().heads_rx = Some(rx);
        tx
    }

    /// Completion channel that fires once per recorded `eth_call`.
    pub fn call_watcher(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().call_notify = Some(tx);
        rx
    }
}

impl ChainClient for TestChain {
    async fn registry_config(&self, registry: Address) -> Result<RegistryConfig> {
        self.state
            .lock()
            .unwrap()
            .configs
            .get(&registry)
            .copied()
            .ok_or_else(|| anyhow!("no config scripted for {registry}"))
    }

    async fn keeper_list(&self, registry: Address) -> Result<Vec<Address>> {
        self.state
            .lock()
            .unwrap()
            .keeper_lists
            .get(&registry)
            .cloned()
            .ok_or_else(|| anyhow!("no keeper list scripted for {registry}"))
    }

    async fn upkeep_count(&self, registry: Address) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .upkeep_counts
            .get(&registry)
            .copied()
            .ok_or_else(|| anyhow!("no upkeep count scripted for {registry}"))
    }

    async fn upkeep(&self, registry: Address, upkeep_id: u64) -> Result<UpkeepInfo> {
        self.state
            .lock()
            .unwrap()
            .upkeeps
            .get(&(registry, upkeep_id))
            .cloned()
            .ok_or_else(|| anyhow!("no upkeep scripted for {registry} id {upkeep_id}"))
    }

    async fn canceled_upkeep_list(&self, registry: Address) -> Result<Vec<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .canceled
            .get(&registry)
            .cloned()
            .unwrap_or_default())
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(tx);
        let result = state
            .call_results
            .pop_front()
            .unwrap_or_else(|| Err("no call result scripted".to_string()));
        if let Some(notify) = &state.call_notify {
            let _ = notify.send(());
        }
        result.map_err(|err| anyhow!(err))
    }

    async fn subscribe_heads(&self) -> Result<HeadStream> {
        let rx = self
            .state
            .lock()
            .unwrap()
            .heads_rx
            .take()
            .ok_or_else(|| anyhow!("no head subscription scripted"))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Automation double recording every trigger and signalling a completion
/// channel.
#[derive(Clone)]
pub struct TestAutomation {
    triggers: Arc<Mutex<Vec<(Uuid, Value)>>>,
    notify_tx: mpsc::UnboundedSender<()>,
}

impl TestAutomation {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        (
            Self {
                triggers: Arc::new(Mutex::new(Vec::new())),
                notify_tx,
            },
            notify_rx,
        )
    }

    pub fn triggers(&self) -> Vec<(Uuid, Value)> {
        self.triggers.lock().unwrap().clone()
    }
}

impl AutomationClient for TestAutomation {
    async fn trigger_job(&self, job_id: Uuid, payload: &Value) -> Result<()> {
        self.triggers.lock().unwrap().push((job_id, payload.clone()));
        let _ = self.notify_tx.send(());
        Ok(())
    }
}
