use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decoded event log, transient per crawl cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_name: String,
    pub args: Map<String, Value>,
    pub address: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: String,
    pub log_index: u64,
}

impl Event {
    /// Deduplication key inside one label.
    pub fn key(&self) -> (String, u64) {
        (self.transaction_hash.clone(), self.log_index)
    }
}

/// Decoded top-level contract call, transient per crawl cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function_name: String,
    pub function_args: Map<String, Value>,
    pub caller_address: String,
    pub contract_address: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: String,
    pub value: String,
    pub status: Option<bool>,
    pub gas_used: Option<u64>,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

/// Row of the per-chain labels table.
///
/// Event labels carry a `log_index`; function-call labels leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRow {
    pub label: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub address: String,
    pub transaction_hash: String,
    pub log_index: Option<u64>,
    pub label_data: Value,
}

/// Row of the per-chain blocks table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRow {
    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub transactions_count: u64,
    pub l1_block_number: Option<u64>,
    pub mix_hash: Option<String>,
}

/// Entry of the external job/heartbeat journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Epoch seconds
    pub created_at: i64,
}

impl JournalEntry {
    /// Value of the first `name:value` tag, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name);
        self.tags
            .iter()
            .find_map(|tag| tag.strip_prefix(prefix.as_str()))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
