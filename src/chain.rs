//! Chain client capability and its alloy HTTP implementation.

use std::str::FromStr;
use std::time::Duration;

use alloy::{
    consensus::Transaction as ConsensusTransaction,
    eips::BlockId,
    network::{ReceiptResponse, TransactionResponse},
    primitives::{Address, Bytes, B256, U256},
    providers::{Provider, ProviderBuilder},
    rpc::types::{BlockNumberOrTag, Filter},
};
use alloy::providers::fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller};
use alloy::providers::{Identity, RootProvider};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::blockchain::Blockchain;
use crate::error::{CrawlerError, Result};

type RPCProvider = FillProvider<JoinFill<Identity, JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>>, RootProvider>;

/// Log filter over an inclusive block range.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    /// topic0 (event signature); `None` matches any event
    pub topic0: Option<B256>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub mix_hash: Option<B256>,
    pub l1_block_number: Option<u64>,
    pub transactions_count: u64,
    /// Empty unless the block was requested with transactions
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainReceipt {
    pub status: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// What the crawler needs from a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64>;

    async fn get_block(&self, number: u64, with_transactions: bool) -> Result<ChainBlock>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>>;

    async fn get_transaction_receipt(&self, hash: B256) -> Result<ChainReceipt>;

    /// Deployed bytecode size of `address` as of `block`.
    async fn get_code_size(&self, address: Address, block: u64) -> Result<usize>;
}

/// Creates fresh chain clients; a dropped connection is never reused.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChainClient>>;
}

/// Chain client over alloy's HTTP JSON-RPC provider.
pub struct AlloyChainClient {
    provider: RPCProvider,
    blockchain: Blockchain,
}

impl AlloyChainClient {
    pub fn connect_http(rpc_url: &str, blockchain: Blockchain) -> Result<Self> {
        let http_rpc = reqwest::Url::from_str(rpc_url)
            .map_err(|e| CrawlerError::Configuration(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;
        let provider = ProviderBuilder::new().connect_http(http_rpc);
        debug!("Connected HTTP provider for {}", blockchain);

        Ok(Self { provider, blockchain })
    }

    /// `l1BlockNumber` is not part of the Ethereum header model, so read it from the raw block.
    async fn l1_block_number(&self, number: u64) -> Result<Option<u64>> {
        let raw: serde_json::Value = self
            .provider
            .raw_request("eth_getBlockByNumber".into(), (BlockNumberOrTag::Number(number), false))
            .await?;

        Ok(raw
            .get("l1BlockNumber")
            .and_then(|v| v.as_str())
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()))
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn get_block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_block(&self, number: u64, with_transactions: bool) -> Result<ChainBlock> {
        let request = self.provider.get_block_by_number(BlockNumberOrTag::Number(number));
        let block = if with_transactions {
            request.full().await?
        } else {
            request.await?
        }
        .ok_or_else(|| CrawlerError::Rpc(format!("Block {} not found", number)))?;

        let transactions = block
            .transactions
            .txns()
            .map(|tx| ChainTransaction {
                hash: TransactionResponse::tx_hash(tx),
                from: TransactionResponse::from(tx),
                to: ConsensusTransaction::to(tx),
                input: ConsensusTransaction::input(tx).clone(),
                value: ConsensusTransaction::value(tx),
                gas_price: ConsensusTransaction::gas_price(tx),
                max_fee_per_gas: Some(ConsensusTransaction::max_fee_per_gas(tx)),
                max_priority_fee_per_gas: ConsensusTransaction::max_priority_fee_per_gas(tx),
            })
            .collect::<Vec<_>>();

        let l1_block_number = if self.blockchain.has_l1_block_number() {
            self.l1_block_number(number).await?
        } else {
            None
        };

        Ok(ChainBlock {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
            mix_hash: Some(block.header.mix_hash),
            l1_block_number,
            transactions_count: block.transactions.len() as u64,
            transactions,
        })
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        let mut rpc_filter = Filter::new()
            .from_block(filter.from_block)
            .to_block(filter.to_block)
            .address(filter.addresses.clone());
        if let Some(topic0) = filter.topic0 {
            rpc_filter = rpc_filter.event_signature(topic0);
        }

        let logs = self.provider.get_logs(&rpc_filter).await?;

        // Pending logs have no position yet and are skipped
        Ok(logs
            .into_iter()
            .filter_map(|log| {
                Some(ChainLog {
                    address: log.address(),
                    topics: log.topics().to_vec(),
                    data: log.data().data.clone(),
                    block_number: log.block_number?,
                    transaction_hash: log.transaction_hash?,
                    log_index: log.log_index?,
                })
            })
            .collect())
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<ChainReceipt> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await?
            .ok_or_else(|| CrawlerError::Rpc(format!("Receipt for {} not found", hash)))?;

        Ok(ChainReceipt {
            status: ReceiptResponse::status(&receipt),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        })
    }

    async fn get_code_size(&self, address: Address, block: u64) -> Result<usize> {
        let code = self
            .provider
            .get_code_at(address)
            .block_id(BlockId::number(block))
            .await?;
        Ok(code.len())
    }
}

/// Connector building [`AlloyChainClient`]s for one RPC endpoint.
pub struct HttpConnector {
    pub rpc_url: String,
    pub blockchain: Blockchain,
    pub poa: bool,
}

#[async_trait]
impl ChainConnector for HttpConnector {
    async fn connect(&self) -> Result<Box<dyn ChainClient>> {
        if self.poa || self.blockchain.is_poa() {
            // alloy accepts arbitrary-length extraData, no response rewriting needed
            debug!("Proof-of-authority chain {}, using raw extraData", self.blockchain);
        }
        let client = AlloyChainClient::connect_http(&self.rpc_url, self.blockchain)?;
        Ok(Box::new(client))
    }
}

/// Reconnect policy for dropped chain connections.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub attempts: usize,
    pub sleep: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            sleep: Duration::from_secs(5),
        }
    }
}

/// Build a new client and check it answers `get_block_number`, retrying with a fixed sleep.
pub async fn retry_connect(
    connector: &dyn ChainConnector,
    blockchain: Blockchain,
    policy: &ReconnectPolicy,
) -> Result<Box<dyn ChainClient>> {
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=policy.attempts {
        let connected = match connector.connect().await {
            Ok(client) => client.get_block_number().await.map(|head| (client, head)),
            Err(e) => Err(e),
        };

        match connected {
            Ok((client, head)) => {
                info!("Connected to {} at head {} (attempt {})", blockchain, head, attempt);
                return Ok(client);
            }
            Err(e) => {
                warn!("Connection attempt {}/{} to {} failed: {}", attempt, policy.attempts, blockchain, e);
                last_error = e.to_string();
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.sleep).await;
                }
            }
        }
    }

    error!("Failed to reconnect to {}", blockchain);
    Err(CrawlerError::ReconnectExhausted {
        blockchain: blockchain.to_string(),
        attempts: policy.attempts,
        last_error,
    })
}

/// First block at which `address` has code, by binary search over `[0, head]`.
///
/// Returns `None` when the address has no code at `head`.
pub async fn find_deployment_block(
    client: &dyn ChainClient,
    address: Address,
    head: u64,
) -> Result<Option<u64>> {
    if client.get_code_size(address, head).await? == 0 {
        return Ok(None);
    }

    let (mut low, mut high) = (0u64, head);
    while low < high {
        let middle = low + (high - low) / 2;
        if client.get_code_size(address, middle).await? > 0 {
            high = middle;
        } else {
            low = middle + 1;
        }
    }

    debug!("Contract {} deployed at block {}", address, low);
    Ok(Some(low))
}
