//! In-memory registry of what to crawl, built from and refreshed against the job journal.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use alloy_json_abi::{Event, Function};
use alloy_primitives::Address;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::abi;
use crate::blockchain::Blockchain;
use crate::error::{CrawlerError, Result};
use crate::journal::JobJournal;
use crate::types::JournalEntry;

pub const PICKED_UP_TAG: &str = "task_pickedup:true";
pub const HISTORICAL_PENDING_TAG: &str = "historical_crawl_status:pending";
pub const HISTORICAL_IN_PROGRESS_TAG: &str = "historical_crawl_status:in_progress";
pub const HISTORICAL_FINISHED_TAG: &str = "historical_crawl_status:finished";
pub const PROGRESS_TAG_PREFIX: &str = "progress:";

const ENTRIES_PAGE_SIZE: usize = 100;

/// Journal entry id -> entry tags
pub type EntryTags = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Event,
    Function,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Event => "event",
            JobKind::Function => "function",
        }
    }
}

/// One event ABI watched on a set of contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCrawlJob {
    pub event_abi_hash: String,
    pub event_abi: Event,
    /// Unique, in order of first appearance
    pub contracts: Vec<Address>,
    pub address_entries: BTreeMap<Address, EntryTags>,
    pub created_at: i64,
}

/// Known function ABIs of one contract, unique by 4-byte selector.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallCrawlJob {
    pub contract_abi: Vec<Function>,
    pub contract_address: Address,
    pub entries_tags: EntryTags,
    pub created_at: i64,
}

impl FunctionCallCrawlJob {
    pub fn has_selector(&self, function: &Function) -> bool {
        let selector = function.selector();
        self.contract_abi.iter().any(|f| f.selector() == selector)
    }
}

fn required_tag<'a>(entry: &'a JournalEntry, tag: &str) -> Result<&'a str> {
    entry.tag_value(tag).ok_or_else(|| CrawlerError::TagNotFound {
        entry_id: entry.id.clone(),
        tag: tag.to_string(),
    })
}

fn entry_address(entry: &JournalEntry) -> Result<Address> {
    let raw = required_tag(entry, "address")?;
    Address::from_str(raw)
        .map_err(|e| CrawlerError::Abi(format!("Entry {} has invalid address {}: {}", entry.id, raw, e)))
}

/// Group event job entries by ABI hash; the first entry's ABI is canonical.
pub fn make_event_crawl_jobs(entries: &[JournalEntry]) -> Result<Vec<EventCrawlJob>> {
    let mut jobs: Vec<EventCrawlJob> = Vec::new();
    let mut index_by_hash: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let abi_hash = required_tag(entry, "abi_method_hash")?.to_string();
        let contract = entry_address(entry)?;

        match index_by_hash.get(&abi_hash) {
            Some(&index) => {
                let job = &mut jobs[index];
                if !job.contracts.contains(&contract) {
                    job.contracts.push(contract);
                }
                job.address_entries
                    .entry(contract)
                    .or_default()
                    .insert(entry.id.clone(), entry.tags.clone());
                job.created_at = job.created_at.max(entry.created_at);
            }
            None => {
                let event_abi = abi::parse_event_abi(&entry.content)?;
                let mut address_entries = BTreeMap::new();
                address_entries.insert(
                    contract,
                    EntryTags::from([(entry.id.clone(), entry.tags.clone())]),
                );
                index_by_hash.insert(abi_hash.clone(), jobs.len());
                jobs.push(EventCrawlJob {
                    event_abi_hash: abi_hash,
                    event_abi,
                    contracts: vec![contract],
                    address_entries,
                    created_at: entry.created_at,
                });
            }
        }
    }

    Ok(jobs)
}

/// Group function job entries by contract; a second ABI with an already known selector is dropped.
pub fn make_function_call_crawl_jobs(entries: &[JournalEntry]) -> Result<Vec<FunctionCallCrawlJob>> {
    let mut jobs: Vec<FunctionCallCrawlJob> = Vec::new();
    let mut index_by_address: HashMap<Address, usize> = HashMap::new();

    for entry in entries {
        let contract = entry_address(entry)?;
        let function = abi::parse_function_abi(&entry.content)?;

        match index_by_address.get(&contract) {
            Some(&index) => {
                let job = &mut jobs[index];
                if job.has_selector(&function) {
                    debug!(
                        "Dropping {} for {}: selector {} already known",
                        function.name,
                        contract,
                        abi::selector_hex(&function)
                    );
                    continue;
                }
                job.contract_abi.push(function);
                job.entries_tags.insert(entry.id.clone(), entry.tags.clone());
                job.created_at = job.created_at.max(entry.created_at);
            }
            None => {
                index_by_address.insert(contract, jobs.len());
                jobs.push(FunctionCallCrawlJob {
                    contract_abi: vec![function],
                    contract_address: contract,
                    entries_tags: EntryTags::from([(entry.id.clone(), entry.tags.clone())]),
                    created_at: entry.created_at,
                });
            }
        }
    }

    Ok(jobs)
}

/// Union `new_jobs` into `old_jobs` by ABI hash. Merging the same set twice is a no-op.
pub fn merge_event_crawl_jobs(old_jobs: &mut Vec<EventCrawlJob>, new_jobs: Vec<EventCrawlJob>) {
    for new_job in new_jobs {
        match old_jobs
            .iter_mut()
            .find(|old| old.event_abi_hash == new_job.event_abi_hash)
        {
            Some(old_job) => {
                for contract in new_job.contracts {
                    if !old_job.contracts.contains(&contract) {
                        old_job.contracts.push(contract);
                    }
                }
                for (contract, entries) in new_job.address_entries {
                    old_job.address_entries.entry(contract).or_default().extend(entries);
                }
                old_job.created_at = old_job.created_at.max(new_job.created_at);
            }
            None => old_jobs.push(new_job),
        }
    }
}

/// Union `new_jobs` into `old_jobs` by contract, never duplicating a selector.
pub fn merge_function_call_crawl_jobs(
    old_jobs: &mut Vec<FunctionCallCrawlJob>,
    new_jobs: Vec<FunctionCallCrawlJob>,
) {
    for new_job in new_jobs {
        match old_jobs
            .iter_mut()
            .find(|old| old.contract_address == new_job.contract_address)
        {
            Some(old_job) => {
                for function in new_job.contract_abi {
                    if !old_job.has_selector(&function) {
                        old_job.contract_abi.push(function);
                    }
                }
                old_job.entries_tags.extend(new_job.entries_tags);
                old_job.created_at = old_job.created_at.max(new_job.created_at);
            }
            None => old_jobs.push(new_job),
        }
    }
}

/// Tag query for active jobs of one kind on one chain.
pub fn crawl_job_query(
    subscription_type: &str,
    kind: JobKind,
    created_at_filter: Option<i64>,
    extra_filters: &[String],
) -> String {
    let mut query = format!(
        "#status:active #type:{} #subscription_type:{}",
        kind.as_str(),
        subscription_type
    );
    for filter in extra_filters {
        query.push(' ');
        query.push_str(filter);
    }
    if let Some(created_at) = created_at_filter {
        query.push_str(&format!(" created_at:>={}", created_at));
    }
    query
}

/// All entries matching the job query, paged through the journal.
pub async fn get_crawl_job_entries(
    journal: &dyn JobJournal,
    subscription_type: &str,
    kind: JobKind,
    created_at_filter: Option<i64>,
    extra_filters: &[String],
) -> Result<Vec<JournalEntry>> {
    let query = crawl_job_query(subscription_type, kind, created_at_filter, extra_filters);
    let mut entries = Vec::new();
    let mut offset = 0;

    loop {
        let page = journal.search(&query, offset, ENTRIES_PAGE_SIZE).await?;
        let page_len = page.len();
        entries.extend(page);
        if page_len < ENTRIES_PAGE_SIZE {
            break;
        }
        offset += page_len;
    }

    debug!("Fetched {} {} job entries", entries.len(), kind.as_str());
    Ok(entries)
}

/// Initial job load for one chain.
pub async fn load_jobs(
    journal: &dyn JobJournal,
    blockchain: Blockchain,
    extra_filters: &[String],
) -> Result<(Vec<EventCrawlJob>, Vec<FunctionCallCrawlJob>)> {
    let subscription_type = blockchain.subscription_type();

    let event_entries =
        get_crawl_job_entries(journal, &subscription_type, JobKind::Event, None, extra_filters).await?;
    let event_jobs = make_event_crawl_jobs(&event_entries)?;

    let function_entries =
        get_crawl_job_entries(journal, &subscription_type, JobKind::Function, None, extra_filters).await?;
    let function_jobs = make_function_call_crawl_jobs(&function_entries)?;

    info!(
        "Loaded {} event jobs and {} function call jobs for {}",
        event_jobs.len(),
        function_jobs.len(),
        blockchain
    );
    Ok((event_jobs, function_jobs))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub event_entries: usize,
    pub function_entries: usize,
    /// Entries left out because no job could be built from them
    pub skipped_entries: usize,
}

/// Keep only the entries `build` accepts on their own, logging the rest.
fn buildable_entries<T>(
    entries: Vec<JournalEntry>,
    build: fn(&[JournalEntry]) -> Result<Vec<T>>,
) -> (Vec<JournalEntry>, usize) {
    let total = entries.len();
    let buildable: Vec<JournalEntry> = entries
        .into_iter()
        .filter(|entry| match build(std::slice::from_ref(entry)) {
            Ok(_) => true,
            Err(e) => {
                warn!("Skipping job entry {}: {}", entry.id, e);
                false
            }
        })
        .collect();
    let skipped = total - buildable.len();
    (buildable, skipped)
}

/// Pull entries created at or after the newest known job and merge them in.
///
/// Entries at exactly the watermark come back every time; merging tolerates that.
/// Malformed entries are skipped so that one bad job cannot stop a running crawler.
pub async fn refetch_new_jobs(
    journal: &dyn JobJournal,
    blockchain: Blockchain,
    event_jobs: &mut Vec<EventCrawlJob>,
    function_jobs: &mut Vec<FunctionCallCrawlJob>,
    extra_filters: &[String],
) -> Result<RefreshSummary> {
    let subscription_type = blockchain.subscription_type();

    let event_watermark = event_jobs.iter().map(|j| j.created_at).max();
    let event_entries =
        get_crawl_job_entries(journal, &subscription_type, JobKind::Event, event_watermark, extra_filters)
            .await?;
    let event_count = event_entries.len();
    let (event_entries, skipped_events) = buildable_entries(event_entries, make_event_crawl_jobs);
    merge_event_crawl_jobs(event_jobs, make_event_crawl_jobs(&event_entries)?);

    let function_watermark = function_jobs.iter().map(|j| j.created_at).max();
    let function_entries = get_crawl_job_entries(
        journal,
        &subscription_type,
        JobKind::Function,
        function_watermark,
        extra_filters,
    )
    .await?;
    let function_count = function_entries.len();
    let (function_entries, skipped_functions) =
        buildable_entries(function_entries, make_function_call_crawl_jobs);
    merge_function_call_crawl_jobs(function_jobs, make_function_call_crawl_jobs(&function_entries)?);

    Ok(RefreshSummary {
        event_entries: event_count,
        function_entries: function_count,
        skipped_entries: skipped_events + skipped_functions,
    })
}

/// Every `(contract, entry id, entry tags)` served by the given jobs.
fn entries_mut<'a>(
    event_jobs: &'a mut [EventCrawlJob],
    function_jobs: &'a mut [FunctionCallCrawlJob],
) -> Vec<(Address, &'a str, &'a mut Vec<String>)> {
    let mut entries = Vec::new();
    for job in event_jobs.iter_mut() {
        for (contract, by_id) in job.address_entries.iter_mut() {
            for (id, tags) in by_id.iter_mut() {
                entries.push((*contract, id.as_str(), tags));
            }
        }
    }
    for job in function_jobs.iter_mut() {
        let contract = job.contract_address;
        for (id, tags) in job.entries_tags.iter_mut() {
            entries.push((contract, id.as_str(), tags));
        }
    }
    entries
}

/// Tag entries that were not yet marked as served. Returns the number tagged.
pub async fn mark_jobs_picked_up(
    journal: &dyn JobJournal,
    event_jobs: &mut [EventCrawlJob],
    function_jobs: &mut [FunctionCallCrawlJob],
) -> Result<usize> {
    let mut tagged = 0;
    for (_, entry_id, tags) in entries_mut(event_jobs, function_jobs) {
        if tags.iter().any(|t| t == PICKED_UP_TAG) {
            continue;
        }
        journal.create_tags(entry_id, &[PICKED_UP_TAG.to_string()]).await?;
        tags.push(PICKED_UP_TAG.to_string());
        tagged += 1;
    }
    if tagged > 0 {
        info!("Marked {} job entries as picked up", tagged);
    }
    Ok(tagged)
}

/// Move historical entries from pending to in-progress.
pub async fn mark_historical_in_progress(
    journal: &dyn JobJournal,
    event_jobs: &mut [EventCrawlJob],
    function_jobs: &mut [FunctionCallCrawlJob],
) -> Result<usize> {
    let mut moved = 0;
    for (_, entry_id, tags) in entries_mut(event_jobs, function_jobs) {
        if !tags.iter().any(|t| t == HISTORICAL_PENDING_TAG) {
            continue;
        }
        journal
            .create_tags(entry_id, &[HISTORICAL_IN_PROGRESS_TAG.to_string()])
            .await?;
        journal.delete_tag(entry_id, HISTORICAL_PENDING_TAG).await?;
        tags.retain(|t| t != HISTORICAL_PENDING_TAG);
        tags.push(HISTORICAL_IN_PROGRESS_TAG.to_string());
        moved += 1;
    }
    Ok(moved)
}

/// `progress:<pct>` tag with two decimals.
pub fn progress_tag(fraction: f64) -> String {
    let percent = (fraction.clamp(0.0, 1.0) * 10_000.0).round() / 100.0;
    format!("{}{:.2}", PROGRESS_TAG_PREFIX, percent)
}

/// Replace each entry's progress tag from a per-contract progress fraction;
/// entries reaching 100% are tagged finished.
pub async fn update_progress_tags(
    journal: &dyn JobJournal,
    event_jobs: &mut [EventCrawlJob],
    function_jobs: &mut [FunctionCallCrawlJob],
    progress: &HashMap<Address, f64>,
) -> Result<usize> {
    let mut updated = 0;
    for (contract, entry_id, tags) in entries_mut(event_jobs, function_jobs) {
        let Some(fraction) = progress.get(&contract) else { continue };
        let new_tag = progress_tag(*fraction);
        if tags.contains(&new_tag) {
            continue;
        }

        let stale: Vec<String> = tags
            .iter()
            .filter(|t| t.starts_with(PROGRESS_TAG_PREFIX))
            .cloned()
            .collect();
        for tag in &stale {
            journal.delete_tag(entry_id, tag).await?;
        }
        tags.retain(|t| !t.starts_with(PROGRESS_TAG_PREFIX));

        let mut to_add = vec![new_tag];
        let finished = *fraction >= 1.0 && !tags.iter().any(|t| t == HISTORICAL_FINISHED_TAG);
        if finished {
            to_add.push(HISTORICAL_FINISHED_TAG.to_string());
        }
        journal.create_tags(entry_id, &to_add).await?;
        if finished && tags.iter().any(|t| t == HISTORICAL_IN_PROGRESS_TAG) {
            journal.delete_tag(entry_id, HISTORICAL_IN_PROGRESS_TAG).await?;
            tags.retain(|t| t != HISTORICAL_IN_PROGRESS_TAG);
        }
        tags.extend(to_add);
        updated += 1;
    }
    Ok(updated)
}

/// Digest identifying the set of ABIs a crawler serves, independent of job order.
pub fn jobs_abi_set_hash(event_jobs: &[EventCrawlJob], function_jobs: &[FunctionCallCrawlJob]) -> String {
    let mut items: Vec<Value> = Vec::new();
    for job in event_jobs {
        items.push(serde_json::json!({
            "type": "event",
            "abi_hash": job.event_abi_hash,
            "signature": job.event_abi.signature(),
        }));
    }
    for job in function_jobs {
        for function in &job.contract_abi {
            items.push(serde_json::json!({
                "type": "function",
                "address": job.contract_address.to_string(),
                "signature": function.signature(),
            }));
        }
    }
    abi::abi_set_hash(&items)
}

/// Every contract address referenced by the jobs, deduplicated.
pub fn all_contracts(event_jobs: &[EventCrawlJob], function_jobs: &[FunctionCallCrawlJob]) -> Vec<Address> {
    let mut contracts: Vec<Address> = Vec::new();
    let candidates = event_jobs
        .iter()
        .flat_map(|j| j.contracts.iter().copied())
        .chain(function_jobs.iter().map(|j| j.contract_address));
    for contract in candidates {
        if !contracts.contains(&contract) {
            contracts.push(contract);
        }
    }
    contracts
}
