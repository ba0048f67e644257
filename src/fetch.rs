//! Event and function-call fetchers over a [`ChainClient`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::abi;
use crate::chain::{ChainBlock, ChainClient, ChainLog, ChainReceipt, LogFilter};
use crate::db::Datastore;
use crate::error::{CrawlerError, Result};
use crate::jobs::{EventCrawlJob, FunctionCallCrawlJob};
use crate::timestamps::BlockTimestampCache;
use crate::types::{Event, FunctionCall};

/// Logs per chunk above which the auto-scaling fetch shrinks its batch.
pub const AUTOSCALE_DENSE_LOGS: usize = 2000;
/// Logs per chunk below which the auto-scaling fetch grows its batch.
pub const AUTOSCALE_SPARSE_LOGS: usize = 100;

/// A log or calldata blob that could not be decoded; reported, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub source: &'static str,
    pub name: String,
    pub address: Address,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub error: String,
}

pub type DecodeErrorHandler<'a> = &'a mut (dyn FnMut(DecodeFailure) + Send);

/// Per-method call counters of a [`ChainStateProvider`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallMetrics {
    pub calls: u64,
    pub errors: u64,
    pub total_ms: u64,
}

/// Chain client wrapper recording call counts and latency per RPC method.
///
/// Reconnecting swaps the inner client; metrics survive the swap.
pub struct ChainStateProvider {
    inner: Box<dyn ChainClient>,
    metrics: Mutex<BTreeMap<&'static str, CallMetrics>>,
}

impl ChainStateProvider {
    pub fn new(inner: Box<dyn ChainClient>) -> Self {
        Self {
            inner,
            metrics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn replace_client(&mut self, inner: Box<dyn ChainClient>) {
        self.inner = inner;
    }

    pub fn metrics(&self) -> BTreeMap<String, CallMetrics> {
        match self.metrics.lock() {
            Ok(metrics) => metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    fn record<T>(&self, method: &'static str, started: Instant, result: &Result<T>) {
        let elapsed = started.elapsed().as_millis() as u64;
        let mut metrics = match self.metrics.lock() {
            Ok(metrics) => metrics,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = metrics.entry(method).or_default();
        entry.calls += 1;
        entry.total_ms += elapsed;
        if result.is_err() {
            entry.errors += 1;
        }
    }
}

#[async_trait]
impl ChainClient for ChainStateProvider {
    async fn get_block_number(&self) -> Result<u64> {
        let started = Instant::now();
        let result = self.inner.get_block_number().await;
        self.record("eth_blockNumber", started, &result);
        result
    }

    async fn get_block(&self, number: u64, with_transactions: bool) -> Result<ChainBlock> {
        let started = Instant::now();
        let result = self.inner.get_block(number, with_transactions).await;
        self.record("eth_getBlockByNumber", started, &result);
        result
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        let started = Instant::now();
        let result = self.inner.get_logs(filter).await;
        self.record("eth_getLogs", started, &result);
        result
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<ChainReceipt> {
        let started = Instant::now();
        let result = self.inner.get_transaction_receipt(hash).await;
        self.record("eth_getTransactionReceipt", started, &result);
        result
    }

    async fn get_code_size(&self, address: Address, block: u64) -> Result<usize> {
        let started = Instant::now();
        let result = self.inner.get_code_size(address, block).await;
        self.record("eth_getCode", started, &result);
        result
    }
}

fn job_filter(job: &EventCrawlJob, from_block: u64, to_block: u64) -> LogFilter {
    LogFilter {
        from_block,
        to_block,
        addresses: job.contracts.clone(),
        topic0: (!job.event_abi.anonymous).then(|| job.event_abi.selector()),
    }
}

async fn decode_logs(
    job: &EventCrawlJob,
    logs: Vec<ChainLog>,
    chain: &dyn ChainClient,
    store: &dyn Datastore,
    cache: &mut BlockTimestampCache,
    on_decode_error: DecodeErrorHandler<'_>,
) -> Result<Vec<Event>> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        let args = match abi::decode_event_log(&job.event_abi, &log.topics, &log.data) {
            Ok(args) => args,
            Err(e) => {
                warn!(
                    "Skipping undecodable {} log {}:{}: {}",
                    job.event_abi.name, log.transaction_hash, log.log_index, e
                );
                on_decode_error(DecodeFailure {
                    source: "event",
                    name: job.event_abi.name.clone(),
                    address: log.address,
                    transaction_hash: log.transaction_hash,
                    block_number: log.block_number,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let block_timestamp = cache.get_timestamp(log.block_number, store, chain).await?;
        events.push(Event {
            event_name: job.event_abi.name.clone(),
            args,
            address: log.address.to_checksum(None),
            block_number: log.block_number,
            block_timestamp,
            transaction_hash: log.transaction_hash.to_string(),
            log_index: log.log_index,
        });
    }
    Ok(events)
}

fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        (a.block_number, a.log_index, &a.transaction_hash).cmp(&(b.block_number, b.log_index, &b.transaction_hash))
    });
}

/// Decoded events of every job within `[from_block, to_block]`, one `get_logs` per job.
pub async fn fetch_events(
    chain: &dyn ChainClient,
    store: &dyn Datastore,
    cache: &mut BlockTimestampCache,
    jobs: &[EventCrawlJob],
    from_block: u64,
    to_block: u64,
    on_decode_error: DecodeErrorHandler<'_>,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for job in jobs.iter().filter(|j| !j.contracts.is_empty()) {
        let logs = chain.get_logs(&job_filter(job, from_block, to_block)).await?;
        debug!(
            "{} logs for {} in [{}, {}]",
            logs.len(),
            job.event_abi.name,
            from_block,
            to_block
        );
        events.extend(decode_logs(job, logs, chain, store, cache, &mut *on_decode_error).await?);
    }
    sort_events(&mut events);
    Ok(events)
}

fn is_result_limit_error(error: &CrawlerError) -> bool {
    let CrawlerError::Rpc(message) = error else { return false };
    let message = message.to_lowercase();
    ["more than", "too many", "limit exceeded", "response size", "range is too large"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Batch size bounds of the auto-scaling fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoscaleBounds {
    pub min: u64,
    pub max: u64,
}

/// Like [`fetch_events`] but walks the range in chunks whose size adapts to log density.
///
/// Chunks that hit a provider result limit are retried at half the size. Returns the
/// events and the batch size to start the next call with.
#[allow(clippy::too_many_arguments)]
pub async fn autoscale_fetch_events(
    chain: &dyn ChainClient,
    store: &dyn Datastore,
    cache: &mut BlockTimestampCache,
    jobs: &[EventCrawlJob],
    from_block: u64,
    to_block: u64,
    batch_size: u64,
    bounds: AutoscaleBounds,
    on_decode_error: DecodeErrorHandler<'_>,
) -> Result<(Vec<Event>, u64)> {
    let min = bounds.min.max(1);
    let max = bounds.max.max(min);
    let mut batch_size = batch_size.clamp(min, max);
    let mut events = Vec::new();

    for job in jobs.iter().filter(|j| !j.contracts.is_empty()) {
        let mut current = from_block;
        while current <= to_block {
            let chunk_end = current.saturating_add(batch_size - 1).min(to_block);
            let logs = match chain.get_logs(&job_filter(job, current, chunk_end)).await {
                Ok(logs) => logs,
                Err(e) if is_result_limit_error(&e) && batch_size > min => {
                    batch_size = (batch_size / 2).max(min);
                    debug!("Result limit hit, shrinking batch to {}", batch_size);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if logs.len() > AUTOSCALE_DENSE_LOGS {
                batch_size = (batch_size / 2).max(min);
            } else if logs.len() < AUTOSCALE_SPARSE_LOGS {
                batch_size = batch_size.saturating_mul(2).min(max);
            }

            events.extend(decode_logs(job, logs, chain, store, cache, &mut *on_decode_error).await?);
            if chunk_end == to_block {
                break;
            }
            current = chunk_end + 1;
        }
    }

    sort_events(&mut events);
    Ok((events, batch_size))
}

/// Decoded top-level calls to the jobs' contracts within `[from_block, to_block]`.
///
/// Each block is read once with its transactions. Transactions whose selector no
/// job ABI knows are skipped silently; the first ABI that decodes wins.
pub async fn fetch_function_calls(
    chain: &dyn ChainClient,
    jobs: &[FunctionCallCrawlJob],
    from_block: u64,
    to_block: u64,
    on_decode_error: DecodeErrorHandler<'_>,
) -> Result<Vec<FunctionCall>> {
    if jobs.is_empty() || from_block > to_block {
        return Ok(Vec::new());
    }

    let by_address: HashMap<Address, &FunctionCallCrawlJob> =
        jobs.iter().map(|job| (job.contract_address, job)).collect();
    let mut calls = Vec::new();

    for number in from_block..=to_block {
        let block = chain.get_block(number, true).await?;

        for tx in &block.transactions {
            let Some(job) = tx.to.and_then(|to| by_address.get(&to)) else { continue };

            let mut decoded = None;
            for function in &job.contract_abi {
                match abi::decode_calldata(function, &tx.input) {
                    Ok(Some(args)) => {
                        decoded = Some((function.name.clone(), args));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        on_decode_error(DecodeFailure {
                            source: "function_call",
                            name: function.name.clone(),
                            address: job.contract_address,
                            transaction_hash: tx.hash,
                            block_number: number,
                            error: e.to_string(),
                        });
                    }
                }
            }
            let Some((function_name, function_args)) = decoded else { continue };

            let receipt = chain.get_transaction_receipt(tx.hash).await?;
            calls.push(FunctionCall {
                function_name,
                function_args,
                caller_address: tx.from.to_checksum(None),
                contract_address: job.contract_address.to_checksum(None),
                block_number: number,
                block_timestamp: block.timestamp,
                transaction_hash: tx.hash.to_string(),
                value: tx.value.to_string(),
                status: Some(receipt.status),
                gas_used: Some(receipt.gas_used),
                gas_price: tx.gas_price.or(Some(receipt.effective_gas_price)),
                max_fee_per_gas: tx.max_fee_per_gas,
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            });
        }
    }

    if !calls.is_empty() {
        info!("Decoded {} function calls in [{}, {}]", calls.len(), from_block, to_block);
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_limit_errors() {
        assert!(is_result_limit_error(&CrawlerError::Rpc(
            "query returned more than 10000 results".into()
        )));
        assert!(is_result_limit_error(&CrawlerError::Rpc("Log response size exceeded".into())));
        assert!(!is_result_limit_error(&CrawlerError::Rpc("connection reset".into())));
        assert!(!is_result_limit_error(&CrawlerError::Database("more than".into())));
    }
}
