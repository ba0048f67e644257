use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::ChainClient;
use crate::checkpoint::{reconcile_range, Checkpoint, CheckpointKey, CheckpointTracker};
use crate::error::{CrawlerError, Result, StepOutcome};
use crate::fetch::{fetch_events, fetch_function_calls, DecodeFailure};
use crate::heartbeat::HeartbeatStatus;
use crate::jobs::{self, EventCrawlJob, FunctionCallCrawlJob};

use super::{CrawlerContext, CrawlerState, FailureTracker, SleepPolicy};

pub const CONTINUOUS_CRAWLER_TYPE: &str = "continuous_crawler";

#[derive(Debug, Clone)]
pub struct ContinuousParams {
    /// Explicit first block; defaults to the safe chain head
    pub start_block: Option<u64>,
    pub max_blocks_batch: u64,
    pub min_blocks_batch: u64,
    pub confirmations: u64,
    pub min_sleep_time: f64,
    pub heartbeat_interval: f64,
    pub new_jobs_refetch_interval: f64,
    pub use_tracker: bool,
    /// Additional tag filters for job refreshes
    pub job_filters: Vec<String>,
}

impl Default for ContinuousParams {
    fn default() -> Self {
        Self {
            start_block: None,
            max_blocks_batch: 100,
            min_blocks_batch: 10,
            confirmations: 60,
            min_sleep_time: 0.1,
            heartbeat_interval: 60.0,
            new_jobs_refetch_interval: 180.0,
            use_tracker: false,
            job_filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// Fewer than `min_blocks_batch` safe blocks ahead of the current block
    Skipped { head: u64, current_block: u64 },
    Crawled {
        from_block: u64,
        to_block: u64,
        events_written: usize,
        calls_written: usize,
    },
}

/// Forward crawler following the chain head.
pub struct ContinuousCrawler {
    ctx: CrawlerContext,
    params: ContinuousParams,
    event_jobs: Vec<EventCrawlJob>,
    function_jobs: Vec<FunctionCallCrawlJob>,
    start_block: u64,
    current_block: u64,
    last_crawled_block: Option<u64>,
    state: CrawlerState,
    sleep: SleepPolicy,
    failures: FailureTracker,
    checkpoint: CheckpointTracker,
    last_heartbeat: Instant,
    last_refetch: Instant,
    jobs_refetched_at: DateTime<Utc>,
    decode_failures: usize,
}

impl ContinuousCrawler {
    pub async fn new(
        ctx: CrawlerContext,
        params: ContinuousParams,
        mut event_jobs: Vec<EventCrawlJob>,
        mut function_jobs: Vec<FunctionCallCrawlJob>,
    ) -> Result<Self> {
        if params.min_blocks_batch > params.max_blocks_batch {
            return Err(CrawlerError::Configuration(format!(
                "min_blocks_batch {} exceeds max_blocks_batch {}",
                params.min_blocks_batch, params.max_blocks_batch
            )));
        }

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

        let start_block = match reconcile_range(params.start_block, None, saved.as_ref(), params.use_tracker).0 {
            Some(start) => start,
            None => ctx
                .chain
                .get_block_number()
                .await?
                .saturating_sub(params.confirmations),
        };

        jobs::mark_jobs_picked_up(ctx.journal.as_ref(), &mut event_jobs, &mut function_jobs).await?;

        info!(
            "Starting continuous crawl of {} from block {} with {} event jobs and {} function call jobs",
            ctx.blockchain,
            start_block,
            event_jobs.len(),
            function_jobs.len()
        );

        let now = Instant::now();
        let crawler = Self {
            sleep: SleepPolicy::new(params.min_sleep_time),
            failures: FailureTracker::new(ctx.failure_ceiling),
            ctx,
            params,
            event_jobs,
            function_jobs,
            start_block,
            current_block: start_block,
            last_crawled_block: None,
            state: CrawlerState::Starting,
            checkpoint,
            last_heartbeat: now,
            last_refetch: now,
            jobs_refetched_at: Utc::now(),
            decode_failures: 0,
        };
        crawler
            .ctx
            .heartbeat
            .heartbeat(&crawler.ctx.crawler_type, crawler.ctx.blockchain, &crawler.status(), false)
            .await?;
        Ok(crawler)
    }

    pub fn current_block(&self) -> u64 {
        self.current_block
    }

    pub fn state(&self) -> CrawlerState {
        self.state
    }

    pub fn sleep_secs(&self) -> f64 {
        self.sleep.current_secs()
    }

    pub fn failures(&self) -> usize {
        self.failures.count()
    }

    pub fn event_jobs(&self) -> &[EventCrawlJob] {
        &self.event_jobs
    }

    pub fn function_jobs(&self) -> &[FunctionCallCrawlJob] {
        &self.function_jobs
    }

    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            status: "crawling".to_string(),
            state: self.state.to_string(),
            start_block: self.start_block,
            last_crawled_block: self.last_crawled_block,
            current_block: self.current_block,
            current_time: Utc::now().to_rfc3339(),
            current_event_jobs_length: self.event_jobs.len(),
            current_function_call_jobs_length: self.function_jobs.len(),
            jobs_last_refetched_at: self.jobs_refetched_at.to_rfc3339(),
            failures: self.failures.count(),
            decode_failures: self.decode_failures,
            progress: None,
            provider_metrics: self.ctx.chain.metrics(),
            die_reason: None,
        }
    }

    /// One crawl cycle without the leading sleep, classified for the run loop.
    pub async fn crawl_once(&mut self) -> StepOutcome<CycleReport> {
        self.cycle().await.into()
    }

    async fn cycle(&mut self) -> Result<CycleReport> {
        self.state = CrawlerState::Crawling;

        let head = self.ctx.chain.get_block_number().await?;
        let end_block = head
            .saturating_sub(self.params.confirmations)
            .min(self.current_block.saturating_add(self.params.max_blocks_batch));

        let report = if self.current_block + self.params.min_blocks_batch > end_block {
            self.sleep.widen();
            debug!(
                "Waiting for blocks: current {}, safe end {}, sleep {:.1}s",
                self.current_block,
                end_block,
                self.sleep.current_secs()
            );
            CycleReport::Skipped {
                head,
                current_block: self.current_block,
            }
        } else {
            self.sleep.narrow();
            self.crawl_range(self.current_block, end_block).await?
        };

        self.maintain().await?;
        Ok(report)
    }

    async fn crawl_range(&mut self, from_block: u64, to_block: u64) -> Result<CycleReport> {
        info!("Crawling {} blocks {}..{}", self.ctx.blockchain, from_block, to_block);

        let mut decode_failures = 0usize;
        let mut on_decode_error = |failure: DecodeFailure| {
            decode_failures += 1;
            debug!("Decode failure: {:?}", failure);
        };

        let events = if self.event_jobs.is_empty() {
            Vec::new()
        } else {
            self.ctx
                .cache
                .prefetch(from_block, to_block, self.ctx.store.as_ref())
                .await?;
            fetch_events(
                &self.ctx.chain,
                self.ctx.store.as_ref(),
                &mut self.ctx.cache,
                &self.event_jobs,
                from_block,
                to_block,
                &mut on_decode_error,
            )
            .await?
        };
        let calls = fetch_function_calls(
            &self.ctx.chain,
            &self.function_jobs,
            from_block,
            to_block,
            &mut on_decode_error,
        )
        .await?;
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
        // A later failed cycle rolls back only its own writes
        self.ctx.writer.commit(self.ctx.store.as_mut()).await?;

        info!(
            "Crawled {}..{}: {} events ({} new), {} calls ({} new)",
            from_block,
            to_block,
            events.len(),
            events_written,
            calls.len(),
            calls_written
        );

        self.last_crawled_block = Some(to_block);
        self.current_block = to_block + 1;

        Ok(CycleReport::Crawled {
            from_block,
            to_block,
            events_written,
            calls_written,
        })
    }

    /// Job refresh and heartbeat when their intervals have elapsed.
    async fn maintain(&mut self) -> Result<()> {
        if self.last_refetch.elapsed() >= Duration::from_secs_f64(self.params.new_jobs_refetch_interval) {
            self.refresh_jobs().await?;
        }
        if self.last_heartbeat.elapsed() >= Duration::from_secs_f64(self.params.heartbeat_interval) {
            self.flush_and_heartbeat().await?;
        }
        self.state = CrawlerState::Crawling;
        Ok(())
    }

    pub async fn refresh_jobs(&mut self) -> Result<()> {
        self.state = CrawlerState::RefreshingJobs;
        let summary = jobs::refetch_new_jobs(
            self.ctx.journal.as_ref(),
            self.ctx.blockchain,
            &mut self.event_jobs,
            &mut self.function_jobs,
            &self.params.job_filters,
        )
        .await?;
        jobs::mark_jobs_picked_up(self.ctx.journal.as_ref(), &mut self.event_jobs, &mut self.function_jobs)
            .await?;

        info!(
            "Refetched jobs: {} event entries, {} function entries, {} skipped; now {} event jobs, {} function call jobs",
            summary.event_entries,
            summary.function_entries,
            summary.skipped_entries,
            self.event_jobs.len(),
            self.function_jobs.len()
        );
        self.last_refetch = Instant::now();
        self.jobs_refetched_at = Utc::now();
        Ok(())
    }

    /// Commit anything still staged, then persist the checkpoint and publish a heartbeat.
    pub async fn flush_and_heartbeat(&mut self) -> Result<()> {
        self.state = CrawlerState::Heartbeat;
        self.ctx.writer.commit(self.ctx.store.as_mut()).await?;

        self.checkpoint
            .save(&Checkpoint {
                start_block: self.current_block,
                end_block: None,
                origin_block: Some(self.start_block),
                finished: false,
            })
            .await?;

        let status = self.status();
        self.ctx
            .heartbeat
            .heartbeat(&self.ctx.crawler_type, self.ctx.blockchain, &status, false)
            .await?;
        self.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Sleep, crawl once and absorb the outcome.
    ///
    /// Returns `Ok(None)` after a recovered failure and `Err` once the crawler is dead.
    pub async fn step(&mut self) -> Result<Option<CycleReport>> {
        tokio::time::sleep(self.sleep.current()).await;

        match self.crawl_once().await {
            StepOutcome::Ok(report) => {
                self.failures.reset();
                Ok(Some(report))
            }
            StepOutcome::Retryable(e) => match self.ctx.recover(&mut self.failures, e).await {
                Ok(()) => Ok(None),
                Err(fatal) => Err(self.die(fatal).await),
            },
            StepOutcome::Fatal(e) => Err(self.die(e).await),
        }
    }

    /// Crawl until the crawler dies; the error is the cause of death.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.step().await?;
        }
    }

    async fn die(&mut self, cause: CrawlerError) -> CrawlerError {
        let status = self.status();
        self.state = CrawlerState::Dead;
        self.ctx.die(status, cause).await
    }
}
