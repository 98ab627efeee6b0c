use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use anyhow::{Context, Result};
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt};

sol!(
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract KeeperRegistry {
        function getConfig() external view returns (
            uint32 paymentPremiumPPB,
            uint256 blockCountPerTurn,
            uint32 checkGasLimit,
            uint256 stalenessSeconds,
            uint256 fallbackGasPrice,
            uint256 fallbackLinkPrice
        );
        function getKeeperList() external view returns (address[] memory keepers);
        function getUpkeepCount() external view returns (uint256 count);
        function getCanceledUpkeepList() external view returns (uint256[] memory ids);
        function getUpkeep(uint256 id) external view returns (
            address target,
            uint32 executeGas,
            bytes memory checkData,
            uint96 balance,
            address lastKeeper,
            address admin,
            uint64 maxValidBlocknumber
        );
        function checkUpkeep(uint256 id, address from) external returns (
            bytes memory performData,
            uint256 maxLinkPayment,
            uint256 gasLimit,
            uint256 adjustedGasWei,
            uint256 linkEth
        );
        function performUpkeep(uint256 id, bytes calldata performData) external returns (bool success);
    }
);

/// Registry config fields the keeper consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RegistryConfig {
    pub check_gas_limit: u32,
    pub block_count_per_turn: u32,
}

/// Upkeep fields the keeper consumes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpkeepInfo {
    pub execute_gas: u32,
    pub check_data: Vec<u8>,
}

pub type HeadStream = Pin<Box<dyn Stream<Item = u64> + Send>>;

/// Typed access to keeper registry contracts plus the generic `eth_call` and
/// head subscription the executer needs.
pub trait ChainClient {
    fn registry_config(
        &self,
        registry: Address,
    ) -> impl Future<Output = Result<RegistryConfig>> + Send;

    fn keeper_list(&self, registry: Address) -> impl Future<Output = Result<Vec<Address>>> + Send;

    fn upkeep_count(&self, registry: Address) -> impl Future<Output = Result<u64>> + Send;

    fn upkeep(
        &self,
        registry: Address,
        upkeep_id: u64,
    ) -> impl Future<Output = Result<UpkeepInfo>> + Send;

    fn canceled_upkeep_list(
        &self,
        registry: Address,
    ) -> impl Future<Output = Result<Vec<u64>>> + Send;

    /// `eth_call` against the latest block.
    fn call(&self, tx: TransactionRequest) -> impl Future<Output = Result<Bytes>> + Send;

    /// Stream of new block heights.
    fn subscribe_heads(&self) -> impl Future<Output = Result<HeadStream>> + Send;
}

type WsProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider,
>;

#[derive(Clone)]
pub struct EvmClient {
    provider: Arc<WsProvider>,
}

impl EvmClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let provider = timeout(
            Duration::from_secs(10),
            ProviderBuilder::new().connect_ws(WsConnect::new(ws_url)),
        )
        .await
        .context("Timed out connecting to the websocket RPC URL")?
        .context("Failed to connect to the websocket RPC URL")?;

        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

impl ChainClient for EvmClient {
    async fn registry_config(&self, registry: Address) -> Result<RegistryConfig> {
        let provider = self.provider.clone();
        let contract = KeeperRegistry::new(registry, &provider);
        let config = contract
            .getConfig()
            .call()
            .await
            .context("Failed to fetch registry config from the RPC")?;

        Ok(RegistryConfig {
            check_gas_limit: config.checkGasLimit,
            block_count_per_turn: config.blockCountPerTurn.saturating_to::<u32>(),
        })
    }

    async fn keeper_list(&self, registry: Address) -> Result<Vec<Address>> {
        let provider = self.provider.clone();
        let contract = KeeperRegistry::new(registry, &provider);
        contract
            .getKeeperList()
            .call()
            .await
            .context("Failed to fetch keeper list from the RPC")
    }

    async fn upkeep_count(&self, registry: Address) -> Result<u64> {
        let provider = self.provider.clone();
        let contract = KeeperRegistry::new(registry, &provider);
        let count = contract
            .getUpkeepCount()
            .call()
            .await
            .context("Failed to fetch upkeep count from the RPC")?;

        Ok(count.saturating_to::<u64>())
    }

    async fn upkeep(&self, registry: Address, upkeep_id: u64) -> Result<UpkeepInfo> {
        let provider = self.provider.clone();
        let contract = KeeperRegistry::new(registry, &provider);
        let upkeep = contract
            .getUpkeep(U256::from(upkeep_id))
            .call()
            .await
            .context("Failed to fetch upkeep from the RPC")?;

        Ok(UpkeepInfo {
            execute_gas: upkeep.executeGas,
            check_data: upkeep.checkData.to_vec(),
        })
    }

    async fn canceled_upkeep_list(&self, registry: Address) -> Result<Vec<u64>> {
        let provider = self.provider.clone();
        let contract = KeeperRegistry::new(registry, &provider);
        let ids = contract
            .getCanceledUpkeepList()
            .call()
            .await
            .context("Failed to fetch cancelled upkeep list from the RPC")?;

        Ok(ids.into_iter().map(|id| id.saturating_to::<u64>()).collect())
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes> {
        self.provider
            .call(tx)
            .await
            .context("eth_call failed")
    }

    async fn subscribe_heads(&self) -> Result<HeadStream> {
        let subscription = self
            .provider
            .subscribe_blocks()
            .await
            .context("Failed to subscribe to new heads")?;

        let stream = subscription.into_stream().map(|header| header.number);
        Ok(Box::pin(stream))
    }
}
