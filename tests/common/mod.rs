#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use evm_label_crawler::chain::{
    ChainBlock, ChainClient, ChainConnector, ChainLog, ChainReceipt, ChainTransaction, LogFilter, ReconnectPolicy,
};
use evm_label_crawler::scheduler::CrawlerContext;
use evm_label_crawler::types::{BlockRow, JournalEntry, LabelRow};
use evm_label_crawler::{
    Blockchain, BlockTimestampCache, CrawlerError, Datastore, IngestionWriter, JobJournal, Result,
};

pub const TRANSFER_ABI: &str = r#"{
    "type": "event",
    "name": "Transfer",
    "inputs": [
        {"name": "from", "type": "address", "indexed": true},
        {"name": "to", "type": "address", "indexed": true},
        {"name": "value", "type": "uint256", "indexed": false}
    ]
}"#;

pub const TRANSFER_FN_ABI: &str = r#"{
    "type": "function",
    "name": "transfer",
    "inputs": [
        {"name": "to", "type": "address"},
        {"name": "amount", "type": "uint256"}
    ],
    "outputs": [{"name": "", "type": "bool"}],
    "stateMutability": "nonpayable"
}"#;

pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
pub const CONTRACT: &str = "0x0000000000000000000000000000000000000abc";
pub const OTHER_CONTRACT: &str = "0x0000000000000000000000000000000000000def";
pub const SENDER: &str = "0x00000000000000000000000000000000000000a1";
pub const RECIPIENT: &str = "0x00000000000000000000000000000000000000b2";

pub fn address(raw: &str) -> Address {
    raw.parse().unwrap()
}

pub fn contract() -> Address {
    address(CONTRACT)
}

pub fn block_timestamp(number: u64) -> u64 {
    1_600_000_000 + number * 12
}

pub fn word(value: u64) -> B256 {
    B256::left_padding_from(&value.to_be_bytes())
}

pub fn address_topic(addr: Address) -> B256 {
    B256::left_padding_from(addr.as_slice())
}

pub fn tx_hash(block: u64, index: u64) -> B256 {
    word(block * 1_000 + index)
}

/// `Transfer(SENDER, RECIPIENT, value)` emitted by `emitter` at `block`.
pub fn transfer_log(emitter: Address, block: u64, log_index: u64, value: u64) -> ChainLog {
    ChainLog {
        address: emitter,
        topics: vec![
            TRANSFER_TOPIC.parse().unwrap(),
            address_topic(address(SENDER)),
            address_topic(address(RECIPIENT)),
        ],
        data: Bytes::copy_from_slice(word(value).as_slice()),
        block_number: block,
        transaction_hash: tx_hash(block, log_index),
        log_index,
    }
}

/// `transfer(RECIPIENT, amount)` sent by SENDER to `target`.
pub fn transfer_call(target: Address, block: u64, index: u64, amount: u64) -> ChainTransaction {
    let mut input = hex::decode("a9059cbb").unwrap();
    input.extend_from_slice(address_topic(address(RECIPIENT)).as_slice());
    input.extend_from_slice(word(amount).as_slice());

    ChainTransaction {
        hash: tx_hash(block, index),
        from: address(SENDER),
        to: Some(target),
        input: Bytes::from(input),
        value: U256::ZERO,
        gas_price: Some(1_000_000_000),
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
    }
}

// ---------------------------------------------------------------------------
// chain

#[derive(Default)]
pub struct ChainState {
    pub head: u64,
    pub logs: Vec<ChainLog>,
    pub transactions: BTreeMap<u64, Vec<ChainTransaction>>,
    pub receipts: HashMap<B256, ChainReceipt>,
    pub deployments: HashMap<Address, u64>,
    pub fail_get_logs: bool,
    pub calls: HashMap<&'static str, usize>,
    pub log_filters: Vec<LogFilter>,
}

#[derive(Clone, Default)]
pub struct FakeChain {
    pub state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub fn with_head(head: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().head = head;
        chain
    }

    pub fn add_log(&self, log: ChainLog) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn add_transaction(&self, block: u64, tx: ChainTransaction) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .entry(block)
            .or_default()
            .push(tx);
    }

    pub fn set_fail_get_logs(&self, fail: bool) {
        self.state.lock().unwrap().fail_get_logs = fail;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().unwrap().calls.get(method).copied().unwrap_or(0)
    }

    fn count(&self, method: &'static str) {
        *self.state.lock().unwrap().calls.entry(method).or_default() += 1;
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_block_number(&self) -> Result<u64> {
        self.count("get_block_number");
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_block(&self, number: u64, with_transactions: bool) -> Result<ChainBlock> {
        self.count("get_block");
        let state = self.state.lock().unwrap();
        if number > state.head {
            return Err(CrawlerError::Rpc(format!("Block {} not found", number)));
        }
        let transactions = state.transactions.get(&number).cloned().unwrap_or_default();

        Ok(ChainBlock {
            number,
            hash: word(number + 7_000_000),
            parent_hash: word(number.saturating_sub(1) + 7_000_000),
            timestamp: block_timestamp(number),
            mix_hash: Some(B256::ZERO),
            l1_block_number: None,
            transactions_count: transactions.len() as u64,
            transactions: if with_transactions { transactions } else { Vec::new() },
        })
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        self.count("get_logs");
        let mut state = self.state.lock().unwrap();
        if state.fail_get_logs {
            return Err(CrawlerError::Rpc("connection reset by peer".to_string()));
        }
        state.log_filters.push(filter.clone());

        Ok(state
            .logs
            .iter()
            .filter(|log| log.block_number >= filter.from_block && log.block_number <= filter.to_block)
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .filter(|log| filter.topic0.is_none() || log.topics.first() == filter.topic0.as_ref())
            .cloned()
            .collect())
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<ChainReceipt> {
        self.count("get_transaction_receipt");
        Ok(self
            .state
            .lock()
            .unwrap()
            .receipts
            .get(&hash)
            .cloned()
            .unwrap_or(ChainReceipt {
                status: true,
                gas_used: 51_000,
                effective_gas_price: 1_000_000_000,
            }))
    }

    async fn get_code_size(&self, address: Address, block: u64) -> Result<usize> {
        self.count("get_code_size");
        Ok(match self.state.lock().unwrap().deployments.get(&address) {
            Some(deployed_at) if block >= *deployed_at => 128,
            _ => 0,
        })
    }
}

pub struct FakeConnector {
    pub chain: FakeChain,
    pub connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(chain: FakeChain) -> Self {
        Self {
            chain,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ChainConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn ChainClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.chain.clone()))
    }
}

// ---------------------------------------------------------------------------
// datastore

#[derive(Default)]
pub struct StoreState {
    pub committed: Vec<LabelRow>,
    pub staged: Vec<LabelRow>,
    pub blocks: BTreeMap<u64, BlockRow>,
    pub staged_blocks: BTreeMap<u64, BlockRow>,
    pub commits: usize,
    pub rollbacks: usize,
    pub timestamp_queries: usize,
    pub fail_inserts: bool,
}

impl StoreState {
    fn labels(&self) -> impl Iterator<Item = &LabelRow> {
        self.committed.iter().chain(self.staged.iter())
    }
}

#[derive(Clone, Default)]
pub struct FakeStore {
    pub state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    /// Store with committed block rows for `[from, to]`.
    pub fn with_blocks(from: u64, to: u64) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.lock().unwrap();
            for number in from..=to {
                state.blocks.insert(
                    number,
                    BlockRow {
                        block_number: number,
                        block_hash: word(number).to_string(),
                        parent_hash: word(number.saturating_sub(1)).to_string(),
                        timestamp: block_timestamp(number),
                        transactions_count: 0,
                        l1_block_number: None,
                        mix_hash: None,
                    },
                );
            }
        }
        store
    }

    pub fn committed_labels(&self) -> Vec<LabelRow> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Committed and staged labels.
    pub fn all_labels(&self) -> Vec<LabelRow> {
        self.state.lock().unwrap().labels().cloned().collect()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn timestamp_queries(&self) -> usize {
        self.state.lock().unwrap().timestamp_queries
    }
}

#[async_trait]
impl Datastore for FakeStore {
    async fn existing_event_keys(&self, label: &str, tx_hashes: &[String]) -> Result<Vec<(String, u64)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .labels()
            .filter(|row| row.label == label && tx_hashes.contains(&row.transaction_hash))
            .filter_map(|row| row.log_index.map(|i| (row.transaction_hash.clone(), i)))
            .collect())
    }

    async fn existing_call_hashes(&self, label: &str, tx_hashes: &[String]) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .labels()
            .filter(|row| row.label == label && row.log_index.is_none())
            .filter(|row| tx_hashes.contains(&row.transaction_hash))
            .map(|row| row.transaction_hash.clone())
            .collect())
    }

    async fn insert_labels(&mut self, labels: &[LabelRow]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_inserts {
            return Err(CrawlerError::Database("insert failed".to_string()));
        }
        state.staged.extend_from_slice(labels);
        Ok(())
    }

    async fn block_timestamps(&self, from_block: u64, to_block: u64) -> Result<Vec<(u64, u64)>> {
        let mut state = self.state.lock().unwrap();
        state.timestamp_queries += 1;
        Ok(state
            .blocks
            .range(from_block..=to_block)
            .map(|(number, row)| (*number, row.timestamp))
            .collect())
    }

    async fn upsert_blocks(&mut self, blocks: &[BlockRow]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut inserted = 0;
        for block in blocks {
            if state.blocks.contains_key(&block.block_number)
                || state.staged_blocks.contains_key(&block.block_number)
            {
                continue;
            }
            state.staged_blocks.insert(block.block_number, block.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let staged = std::mem::take(&mut state.staged);
        state.committed.extend(staged);
        let staged_blocks = std::mem::take(&mut state.staged_blocks);
        state.blocks.extend(staged_blocks);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.staged.clear();
        state.staged_blocks.clear();
        state.rollbacks += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// journal

#[derive(Default)]
pub struct JournalState {
    pub entries: Vec<JournalEntry>,
    pub next_id: usize,
    pub searches: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeJournal {
    pub state: Arc<Mutex<JournalState>>,
}

/// `#tag` requires a tag, `!#tag` forbids it, `created_at:>=N` bounds creation time.
fn matches_query(entry: &JournalEntry, query: &str) -> bool {
    query.split_whitespace().all(|token| {
        if let Some(tag) = token.strip_prefix("!#") {
            !entry.has_tag(tag)
        } else if let Some(tag) = token.strip_prefix('#') {
            entry.has_tag(tag)
        } else if let Some(bound) = token.strip_prefix("created_at:>=") {
            bound.parse::<i64>().map(|b| entry.created_at >= b).unwrap_or(false)
        } else {
            true
        }
    })
}

impl FakeJournal {
    pub fn add_entry(&self, content: &str, tags: &[String], created_at: i64) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("entry-{}", state.next_id);
        state.entries.push(JournalEntry {
            id: id.clone(),
            title: id.clone(),
            content: content.to_string(),
            tags: tags.to_vec(),
            created_at,
        });
        id
    }

    pub fn entry(&self, id: &str) -> Option<JournalEntry> {
        self.state.lock().unwrap().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Entries carrying every tag in `tags`.
    pub fn find(&self, tags: &[&str]) -> Vec<JournalEntry> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| tags.iter().all(|t| e.has_tag(t)))
            .cloned()
            .collect()
    }

    pub fn searches(&self) -> usize {
        self.state.lock().unwrap().searches.len()
    }
}

#[async_trait]
impl JobJournal for FakeJournal {
    async fn search(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<JournalEntry>> {
        let mut state = self.state.lock().unwrap();
        state.searches.push(query.to_string());
        Ok(state
            .entries
            .iter()
            .filter(|e| matches_query(e, query))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_entry(&self, title: &str, content: &str, tags: &[String]) -> Result<JournalEntry> {
        let id = self.add_entry(content, tags, chrono::Utc::now().timestamp());
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| CrawlerError::Journal("entry vanished".to_string()))?;
        entry.title = title.to_string();
        Ok(entry.clone())
    }

    async fn update_entry_content(&self, entry_id: &str, title: &str, content: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| CrawlerError::Journal(format!("No entry {}", entry_id)))?;
        entry.title = title.to_string();
        entry.content = content.to_string();
        Ok(())
    }

    async fn create_tags(&self, entry_id: &str, tags: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| CrawlerError::Journal(format!("No entry {}", entry_id)))?;
        for tag in tags {
            if !entry.tags.contains(tag) {
                entry.tags.push(tag.clone());
            }
        }
        Ok(())
    }

    async fn delete_tag(&self, entry_id: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| CrawlerError::Journal(format!("No entry {}", entry_id)))?;
        entry.tags.retain(|t| t != tag);
        Ok(())
    }
}

/// Tags of an active event job entry for `Transfer` on `contract_address`.
pub fn event_job_tags(contract_address: &str, extra: &[&str]) -> Vec<String> {
    let mut tags = vec![
        "abi_method_hash:transfer0001".to_string(),
        format!("address:{}", contract_address),
        "status:active".to_string(),
        "type:event".to_string(),
        "subscription_type:ethereum_smartcontract".to_string(),
    ];
    tags.extend(extra.iter().map(|t| t.to_string()));
    tags
}

pub fn function_job_tags(contract_address: &str) -> Vec<String> {
    vec![
        "abi_method_hash:transferfn0001".to_string(),
        format!("address:{}", contract_address),
        "status:active".to_string(),
        "type:function".to_string(),
        "subscription_type:ethereum_smartcontract".to_string(),
    ]
}

pub async fn context(
    chain: &FakeChain,
    store: &FakeStore,
    journal: &FakeJournal,
    crawler_type: &str,
) -> (CrawlerContext, Arc<AtomicUsize>) {
    let connector = FakeConnector::new(chain.clone());
    let connects = connector.connects.clone();
    let ctx = CrawlerContext::connect(
        Blockchain::Ethereum,
        crawler_type,
        Box::new(connector),
        ReconnectPolicy {
            attempts: 3,
            sleep: Duration::from_secs(1),
        },
        Box::new(store.clone()),
        Arc::new(journal.clone()),
        Arc::new(journal.clone()),
        IngestionWriter::default(),
        BlockTimestampCache::new(100),
    )
    .await
    .unwrap();
    (ctx, connects)
}
