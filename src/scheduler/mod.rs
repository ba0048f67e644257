//! Crawl schedulers: shared collaborators, sleep backoff and failure handling.

pub mod continuous;
pub mod historical;

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::blockchain::Blockchain;
use crate::chain::{retry_connect, ChainConnector, ReconnectPolicy};
use crate::db::Datastore;
use crate::error::{CrawlerError, Result};
use crate::fetch::ChainStateProvider;
use crate::heartbeat::{HeartbeatReporter, HeartbeatStatus};
use crate::journal::JobJournal;
use crate::timestamps::BlockTimestampCache;
use crate::writer::IngestionWriter;

pub use continuous::{ContinuousCrawler, ContinuousParams, CycleReport};
pub use historical::{progress_fraction, HistoricalCrawler, HistoricalParams, HistoricalSummary};

pub const DEFAULT_FAILURE_CEILING: usize = 10;
pub const SLEEP_STEP_SECS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerState {
    Starting,
    Crawling,
    RefreshingJobs,
    Heartbeat,
    Dead,
}

impl fmt::Display for CrawlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrawlerState::Starting => "starting",
            CrawlerState::Crawling => "crawling",
            CrawlerState::RefreshingJobs => "refreshing_jobs",
            CrawlerState::Heartbeat => "heartbeat",
            CrawlerState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Additive sleep backoff between cycles, floored at `min`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SleepPolicy {
    current: f64,
    min: f64,
}

impl SleepPolicy {
    pub fn new(min_sleep_secs: f64) -> Self {
        let min = min_sleep_secs.max(0.0);
        Self { current: min, min }
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.current)
    }

    pub fn current_secs(&self) -> f64 {
        self.current
    }

    /// Not enough new blocks: wait a little longer next time.
    pub fn widen(&mut self) {
        self.current += SLEEP_STEP_SECS;
    }

    pub fn narrow(&mut self) {
        self.current = (self.current - SLEEP_STEP_SECS).max(self.min);
    }
}

/// Consecutive cycle failures; exceeding the ceiling kills the crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTracker {
    count: usize,
    ceiling: usize,
}

impl FailureTracker {
    pub fn new(ceiling: usize) -> Self {
        Self { count: 0, ceiling }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Count a failure; `true` once the ceiling is exceeded.
    pub fn record(&mut self) -> bool {
        self.count += 1;
        self.count > self.ceiling
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_CEILING)
    }
}

/// Everything a scheduler owns for its lifetime, injected at construction.
pub struct CrawlerContext {
    pub blockchain: Blockchain,
    pub crawler_type: String,
    pub chain: ChainStateProvider,
    pub connector: Box<dyn ChainConnector>,
    pub reconnect: ReconnectPolicy,
    pub store: Box<dyn Datastore>,
    /// Source of crawl jobs; pick-up and progress tags go here too
    pub journal: Arc<dyn JobJournal>,
    /// Heartbeats and checkpoints
    pub state_journal: Arc<dyn JobJournal>,
    pub heartbeat: HeartbeatReporter,
    pub writer: IngestionWriter,
    pub cache: BlockTimestampCache,
    pub failure_ceiling: usize,
}

impl CrawlerContext {
    /// Connect to the chain through `connector` and assemble the context.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        blockchain: Blockchain,
        crawler_type: impl Into<String>,
        connector: Box<dyn ChainConnector>,
        reconnect: ReconnectPolicy,
        store: Box<dyn Datastore>,
        journal: Arc<dyn JobJournal>,
        state_journal: Arc<dyn JobJournal>,
        writer: IngestionWriter,
        cache: BlockTimestampCache,
    ) -> Result<Self> {
        let client = retry_connect(connector.as_ref(), blockchain, &reconnect).await?;
        Ok(Self {
            blockchain,
            crawler_type: crawler_type.into(),
            chain: ChainStateProvider::new(client),
            connector,
            reconnect,
            heartbeat: HeartbeatReporter::new(state_journal.clone()),
            store,
            journal,
            state_journal,
            writer,
            cache,
            failure_ceiling: DEFAULT_FAILURE_CEILING,
        })
    }

    /// Undo a failed cycle: roll back staged writes and replace the chain client.
    ///
    /// Returns the error the crawler must die with, if any.
    pub async fn recover(&mut self, failures: &mut FailureTracker, cause: CrawlerError) -> Result<()> {
        if let Err(e) = self.store.rollback().await {
            warn!("Rollback after failed cycle failed: {}", e);
        }

        if failures.record() {
            return Err(CrawlerError::FailureCeiling {
                failures: failures.count(),
                last_error: cause.to_string(),
            });
        }
        warn!(
            "Cycle failed ({} consecutive): {}. Reconnecting to {}",
            failures.count(),
            cause,
            self.blockchain
        );

        let client = retry_connect(self.connector.as_ref(), self.blockchain, &self.reconnect).await?;
        self.chain.replace_client(client);
        Ok(())
    }

    /// Publish a final dead heartbeat and hand back the error to terminate with.
    pub async fn die(&self, mut status: HeartbeatStatus, cause: CrawlerError) -> CrawlerError {
        error!("{} crawler on {} is dead: {}", self.crawler_type, self.blockchain, cause);
        status.status = CrawlerState::Dead.to_string();
        status.state = CrawlerState::Dead.to_string();
        status.die_reason = Some(death_report(&cause));

        if let Err(e) = self
            .heartbeat
            .heartbeat(&self.crawler_type, self.blockchain, &status, true)
            .await
        {
            error!("Failed to send dead heartbeat: {}", e);
        }
        cause
    }
}

/// Cause of death with its debug form and the stack it was raised on.
fn death_report(cause: &CrawlerError) -> String {
    format!("{}\n{:#?}\n{}", cause, cause, Backtrace::force_capture())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_death_report_carries_stack_trace() {
        let cause = CrawlerError::Rpc("connection reset".into());
        let report = death_report(&cause);
        let head = format!("{}\n{:#?}\n", cause, cause);
        assert!(report.starts_with(&head));
        assert!(report.len() > head.len());
    }

    #[test]
    fn test_sleep_policy_is_additive_and_floored() {
        let mut sleep = SleepPolicy::new(0.5);
        sleep.narrow();
        assert_eq!(sleep.current_secs(), 0.5);

        sleep.widen();
        sleep.widen();
        assert!((sleep.current_secs() - 0.7).abs() < 1e-9);

        for _ in 0..10 {
            sleep.narrow();
        }
        assert_eq!(sleep.current_secs(), 0.5);
    }

    #[test]
    fn test_failure_tracker_ceiling() {
        let mut failures = FailureTracker::new(3);
        assert!(!failures.record());
        assert!(!failures.record());
        assert!(!failures.record());
        assert!(failures.record());

        failures.reset();
        assert_eq!(failures.count(), 0);
    }
}
