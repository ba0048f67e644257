use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::Address;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{find_deployment_block, ChainClient};
use crate::checkpoint::{reconcile_range, Checkpoint, CheckpointKey, CheckpointTracker};
use crate::error::{CrawlerError, Result, StepOutcome};
use crate::fetch::{autoscale_fetch_events, fetch_events, fetch_function_calls, AutoscaleBounds, DecodeFailure};
use crate::heartbeat::HeartbeatStatus;
use crate::jobs::{self, EventCrawlJob, FunctionCallCrawlJob};

use super::{CrawlerContext, CrawlerState, FailureTracker};

pub const HISTORICAL_CRAWLER_TYPE: &str = "historical_crawler";

#[derive(Debug, Clone)]
pub struct HistoricalParams {
    /// Highest block to crawl from; defaults to the chain head
    pub start_block: Option<u64>,
    /// Lowest block to crawl down to
    pub end_block: Option<u64>,
    pub max_blocks_batch: u64,
    /// Lower bound of the auto-scaling log chunk size
    pub min_blocks_batch: u64,
    pub min_sleep_time: f64,
    pub heartbeat_interval: f64,
    pub use_tracker: bool,
    /// Search each contract's deployment block for progress reporting
    pub find_deployed_blocks: bool,
}

impl Default for HistoricalParams {
    fn default() -> Self {
        Self {
            start_block: None,
            end_block: None,
            max_blocks_batch: 100,
            min_blocks_batch: 10,
            min_sleep_time: 0.1,
            heartbeat_interval: 60.0,
            use_tracker: false,
            find_deployed_blocks: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalSummary {
    /// `(high, low)` of every committed batch, in crawl order
    pub batches: Vec<(u64, u64)>,
    pub events_written: usize,
    pub calls_written: usize,
    pub progress: f64,
    pub contract_progress: HashMap<Address, f64>,
}

/// Share of `[deployment_block, original_start]` already crawled down to `position`.
///
/// A zero-length range counts as complete.
pub fn progress_fraction(original_start: u64, position: u64, deployment_block: u64) -> f64 {
    if original_start <= deployment_block {
        return 1.0;
    }
    let crawled = original_start.saturating_sub(position) as f64;
    let total = (original_start - deployment_block) as f64;
    (crawled / total).clamp(0.0, 1.0)
}

/// Backward crawler from a recent block down to a deployment or genesis block.
pub struct HistoricalCrawler {
    ctx: CrawlerContext,
    params: HistoricalParams,
    event_jobs: Vec<EventCrawlJob>,
    function_jobs: Vec<FunctionCallCrawlJob>,
    original_start: u64,
    start_block: u64,
    end_block: u64,
    deployment_blocks: HashMap<Address, u64>,
    autoscale_batch: u64,
    state: CrawlerState,
    failures: FailureTracker,
    checkpoint: CheckpointTracker,
    last_heartbeat: Instant,
    decode_failures: usize,
    finished: bool,
    summary: HistoricalSummary,
}

impl HistoricalCrawler {
    pub async fn new(
        ctx: CrawlerContext,
        params: HistoricalParams,
        mut event_jobs: Vec<EventCrawlJob>,
        mut function_jobs: Vec<FunctionCallCrawlJob>,
    ) -> Result<Self> {
        let key = CheckpointKey {
            crawler_type: ctx.crawler_type.clone(),
            blockchain: ctx.blockchain,
            abi_set_hash: jobs::jobs_abi_set_hash(&event_jobs, &function_jobs),
        };
        let mut checkpoint = CheckpointTracker::new(ctx.state_journal.clone(), key);
        let saved = if params.use_tracker {
            checkpoint.load().await?
        } else {
            None
        };

        let (start, end) = reconcile_range(params.start_block, params.end_block, saved.as_ref(), params.use_tracker);
        let head = ctx.chain.get_block_number().await?;
        let start_block = start.unwrap_or(head);
        let mut end_block = end.unwrap_or(0);

        if start_block < end_block {
            return Err(CrawlerError::InvalidRange {
                start: start_block,
                end: end_block,
                reason: "historical crawl requires start_block >= end_block".to_string(),
            });
        }

        let finished = params.use_tracker && saved.as_ref().is_some_and(|c| c.finished);
        let original_start = saved
            .as_ref()
            .filter(|_| params.use_tracker)
            .and_then(|c| c.origin_block)
            .unwrap_or(start_block);

        let mut deployment_blocks = HashMap::new();
        if params.find_deployed_blocks {
            for contract in jobs::all_contracts(&event_jobs, &function_jobs) {
                match find_deployment_block(&ctx.chain, contract, head).await? {
                    Some(block) => {
                        deployment_blocks.insert(contract, block);
                    }
                    None => warn!("No code found for {} at head {}", contract, head),
                }
            }
            // Nothing to crawl below the earliest deployment
            if let Some(earliest) = deployment_blocks.values().min().copied() {
                if earliest > end_block && earliest <= start_block {
                    info!("Raising end block {} to earliest deployment {}", end_block, earliest);
                    end_block = earliest;
                }
            }
        }

        jobs::mark_jobs_picked_up(ctx.journal.as_ref(), &mut event_jobs, &mut function_jobs).await?;
        jobs::mark_historical_in_progress(ctx.journal.as_ref(), &mut event_jobs, &mut function_jobs).await?;

        info!(
            "Starting historical crawl of {} from {} down to {} with {} event jobs and {} function call jobs",
            ctx.blockchain,
            start_block,
            end_block,
            event_jobs.len(),
            function_jobs.len()
        );

        Ok(Self {
            failures: FailureTracker::new(ctx.failure_ceiling),
            autoscale_batch: params.max_blocks_batch.max(1),
            ctx,
            params,
            event_jobs,
            function_jobs,
            original_start,
            start_block,
            end_block,
            deployment_blocks,
            state: CrawlerState::Starting,
            checkpoint,
            last_heartbeat: Instant::now(),
            decode_failures: 0,
            finished,
            summary: HistoricalSummary {
                progress: if finished { 1.0 } else { 0.0 },
                ..Default::default()
            },
        })
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    pub fn end_block(&self) -> u64 {
        self.end_block
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn summary(&self) -> &HistoricalSummary {
        &self.summary
    }

    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            status: if self.finished { "finished" } else { "crawling" }.to_string(),
            state: self.state.to_string(),
            start_block: self.original_start,
            last_crawled_block: self.summary.batches.last().map(|(_, low)| *low),
            current_block: self.start_block,
            current_time: Utc::now().to_rfc3339(),
            current_event_jobs_length: self.event_jobs.len(),
            current_function_call_jobs_length: self.function_jobs.len(),
            jobs_last_refetched_at: String::new(),
            failures: self.failures.count(),
            decode_failures: self.decode_failures,
            progress: Some(self.summary.progress),
            provider_metrics: self.ctx.chain.metrics(),
            die_reason: None,
        }
    }

    /// Crawl, commit and checkpoint the next batch below `start_block`.
    pub async fn crawl_batch(&mut self) -> StepOutcome<(u64, u64)> {
        self.batch().await.into()
    }

    async fn batch(&mut self) -> Result<(u64, u64)> {
        self.state = CrawlerState::Crawling;
        let high = self.start_block;
        let low = high
            .saturating_sub(self.params.max_blocks_batch)
            .max(self.end_block);
        info!("Crawling {} blocks {}..{} backwards", self.ctx.blockchain, high, low);

        let mut decode_failures = 0usize;
        let mut on_decode_error = |failure: DecodeFailure| {
            decode_failures += 1;
            debug!("Decode failure: {:?}", failure);
        };

        let events = if self.event_jobs.is_empty() {
            Vec::new()
        } else if self.function_jobs.is_empty() {
            let (events, next_batch) = autoscale_fetch_events(
                &self.ctx.chain,
                self.ctx.store.as_ref(),
                &mut self.ctx.cache,
                &self.event_jobs,
                low,
                high,
                self.autoscale_batch,
                AutoscaleBounds {
                    min: self.params.min_blocks_batch,
                    max: self.params.max_blocks_batch,
                },
                &mut on_decode_error,
            )
            .await?;
            self.autoscale_batch = next_batch;
            events
        } else {
            fetch_events(
                &self.ctx.chain,
                self.ctx.store.as_ref(),
                &mut self.ctx.cache,
                &self.event_jobs,
                low,
                high,
                &mut on_decode_error,
            )
            .await?
        };
        let calls = fetch_function_calls(&self.ctx.chain, &self.function_jobs, low, high, &mut on_decode_error).await?;
        self.decode_failures += decode_failures;

        let events_written = self
            .ctx
            .writer
            .add_events_to_session(self.ctx.store.as_mut(), &events)
            .await?;
        let calls_written = self
            .ctx
            .writer
            .add_function_calls_to_session(self.ctx.store.as_mut(), &calls)
            .await?;
        self.ctx.writer.commit(self.ctx.store.as_mut()).await?;

        // Committed: the batch never needs crawling again
        self.finished = low == self.end_block;
        self.start_block = if self.finished { self.end_block } else { low - 1 };
        self.summary.batches.push((high, low));
        self.summary.events_written += events_written;
        self.summary.calls_written += calls_written;
        self.summary.progress = progress_fraction(self.original_start, low, self.end_block);

        let contract_progress: HashMap<Address, f64> = jobs::all_contracts(&self.event_jobs, &self.function_jobs)
            .into_iter()
            .map(|contract| {
                let deployment = self.deployment_blocks.get(&contract).copied().unwrap_or(self.end_block);
                (contract, progress_fraction(self.original_start, low, deployment))
            })
            .collect();
        self.summary.contract_progress = contract_progress;

        info!(
            "Committed {}..{}: {} new events, {} new calls, progress {:.2}%",
            high,
            low,
            events_written,
            calls_written,
            self.summary.progress * 100.0
        );

        self.checkpoint
            .save(&Checkpoint {
                start_block: self.start_block,
                end_block: Some(self.end_block),
                origin_block: Some(self.original_start),
                finished: self.finished,
            })
            .await?;
        jobs::update_progress_tags(
            self.ctx.journal.as_ref(),
            &mut self.event_jobs,
            &mut self.function_jobs,
            &self.summary.contract_progress,
        )
        .await?;

        if self.finished
            || self.last_heartbeat.elapsed() >= Duration::from_secs_f64(self.params.heartbeat_interval)
        {
            self.state = CrawlerState::Heartbeat;
            let status = self.status();
            self.ctx
                .heartbeat
                .heartbeat(&self.ctx.crawler_type, self.ctx.blockchain, &status, false)
                .await?;
            self.last_heartbeat = Instant::now();
        }
        self.state = CrawlerState::Crawling;

        Ok((high, low))
    }

    /// Crawl every remaining batch. Dies like the continuous crawler on repeated failure.
    pub async fn run(&mut self) -> Result<HistoricalSummary> {
        while !self.finished {
            match self.crawl_batch().await {
                StepOutcome::Ok(_) => self.failures.reset(),
                StepOutcome::Retryable(e) => {
                    if let Err(fatal) = self.ctx.recover(&mut self.failures, e).await {
                        return Err(self.die(fatal).await);
                    }
                }
                StepOutcome::Fatal(e) => return Err(self.die(e).await),
            }
            if !self.finished {
                tokio::time::sleep(Duration::from_secs_f64(self.params.min_sleep_time.max(0.0))).await;
            }
        }

        info!(
            "Historical crawl of {} finished: {} batches, {} events, {} calls",
            self.ctx.blockchain,
            self.summary.batches.len(),
            self.summary.events_written,
            self.summary.calls_written
        );
        Ok(self.summary.clone())
    }

    async fn die(&mut self, cause: CrawlerError) -> CrawlerError {
        let status = self.status();
        self.state = CrawlerState::Dead;
        self.ctx.die(status, cause).await
    }
}
