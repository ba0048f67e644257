//! Operational status snapshots published to the journal, one entry per crawler.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::blockchain::Blockchain;
use crate::error::Result;
use crate::fetch::CallMetrics;
use crate::journal::JobJournal;

pub const HEARTBEAT_TAG: &str = "heartbeat";
pub const DEAD_TAG: &str = "dead";

/// Content of a heartbeat entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatStatus {
    pub status: String,
    pub state: String,
    pub start_block: u64,
    pub last_crawled_block: Option<u64>,
    pub current_block: u64,
    pub current_time: String,
    pub current_event_jobs_length: usize,
    pub current_function_call_jobs_length: usize,
    pub jobs_last_refetched_at: String,
    pub failures: usize,
    pub decode_failures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub provider_metrics: BTreeMap<String, CallMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub die_reason: Option<String>,
}

pub struct HeartbeatReporter {
    journal: Arc<dyn JobJournal>,
}

impl HeartbeatReporter {
    pub fn new(journal: Arc<dyn JobJournal>) -> Self {
        Self { journal }
    }

    /// Overwrite the crawler's heartbeat entry with `status`, creating it on first use.
    ///
    /// A dead crawler's entry also gets the `dead` tag, which takes it out of the lookup.
    pub async fn heartbeat<S: Serialize + Sync>(
        &self,
        crawler_type: &str,
        blockchain: Blockchain,
        status: &S,
        is_dead: bool,
    ) -> Result<()> {
        let title = format!("{} {} heartbeat", blockchain, crawler_type);
        let content = serde_json::to_string_pretty(status)?;
        let query = format!("#{} #{} #{} !#{}", crawler_type, HEARTBEAT_TAG, blockchain, DEAD_TAG);

        let existing = self.journal.search(&query, 0, 1).await?;
        let entry_id = match existing.into_iter().next() {
            Some(entry) => {
                self.journal.update_entry_content(&entry.id, &title, &content).await?;
                entry.id
            }
            None => {
                let tags = vec![
                    crawler_type.to_string(),
                    HEARTBEAT_TAG.to_string(),
                    blockchain.to_string(),
                ];
                let entry = self.journal.create_entry(&title, &content, &tags).await?;
                info!("Created heartbeat entry {} for {} {}", entry.id, blockchain, crawler_type);
                entry.id
            }
        };

        if is_dead {
            self.journal.create_tags(&entry_id, &[DEAD_TAG.to_string()]).await?;
            info!("Heartbeat entry {} tagged dead", entry_id);
        } else {
            debug!("Heartbeat sent to entry {}", entry_id);
        }
        Ok(())
    }
}
