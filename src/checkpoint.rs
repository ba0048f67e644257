//! Crawl position persisted in the journal, keyed by crawler type, chain and ABI set.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::blockchain::Blockchain;
use crate::error::Result;
use crate::journal::JobJournal;

pub const CHECKPOINT_TAG: &str = "checkpoint";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    pub crawler_type: String,
    pub blockchain: Blockchain,
    pub abi_set_hash: String,
}

impl CheckpointKey {
    pub fn tags(&self) -> Vec<String> {
        vec![
            CHECKPOINT_TAG.to_string(),
            self.crawler_type.clone(),
            self.blockchain.to_string(),
            format!("abi_set_hash:{}", self.abi_set_hash),
        ]
    }

    fn query(&self) -> String {
        self.tags()
            .iter()
            .map(|t| format!("#{}", t))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Next block to crawl and, for historical crawls, the block to stop at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub start_block: u64,
    pub end_block: Option<u64>,
    /// First block of the whole historical crawl, for progress across restarts
    #[serde(default)]
    pub origin_block: Option<u64>,
    #[serde(default)]
    pub finished: bool,
}

pub struct CheckpointTracker {
    journal: Arc<dyn JobJournal>,
    key: CheckpointKey,
    entry_id: Option<String>,
}

impl CheckpointTracker {
    pub fn new(journal: Arc<dyn JobJournal>, key: CheckpointKey) -> Self {
        Self {
            journal,
            key,
            entry_id: None,
        }
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    pub async fn load(&mut self) -> Result<Option<Checkpoint>> {
        let Some(entry) = self.journal.search(&self.key.query(), 0, 1).await?.into_iter().next() else {
            return Ok(None);
        };
        self.entry_id = Some(entry.id.clone());

        match serde_json::from_str::<Checkpoint>(&entry.content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint {:?} for {} {}",
                    checkpoint, self.key.blockchain, self.key.crawler_type
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint entry {}: {}", entry.id, e);
                Ok(None)
            }
        }
    }

    /// Persist `checkpoint`; call only after the writes it covers are committed.
    pub async fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let content = serde_json::to_string(checkpoint)?;
        let title = format!(
            "{} {} checkpoint {}",
            self.key.blockchain, self.key.crawler_type, self.key.abi_set_hash
        );

        if self.entry_id.is_none() {
            self.entry_id = self
                .journal
                .search(&self.key.query(), 0, 1)
                .await?
                .into_iter()
                .next()
                .map(|e| e.id);
        }

        match &self.entry_id {
            Some(id) => self.journal.update_entry_content(id, &title, &content).await?,
            None => {
                let entry = self.journal.create_entry(&title, &content, &self.key.tags()).await?;
                self.entry_id = Some(entry.id);
            }
        }
        Ok(())
    }
}

/// Resolve the crawl bounds from explicit arguments and the persisted checkpoint.
///
/// With `use_tracker` a checkpoint wins over the explicit start; an explicit end is kept.
pub fn reconcile_range(
    requested_start: Option<u64>,
    requested_end: Option<u64>,
    checkpoint: Option<&Checkpoint>,
    use_tracker: bool,
) -> (Option<u64>, Option<u64>) {
    match checkpoint {
        Some(checkpoint) if use_tracker => (
            Some(checkpoint.start_block),
            requested_end.or(checkpoint.end_block),
        ),
        _ => (requested_start, requested_end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_prefers_checkpoint_with_tracker() {
        let checkpoint = Checkpoint {
            start_block: 500,
            end_block: Some(100),
            origin_block: Some(900),
            finished: false,
        };
        assert_eq!(reconcile_range(Some(900), None, Some(&checkpoint), true), (Some(500), Some(100)));
        assert_eq!(reconcile_range(Some(900), Some(0), Some(&checkpoint), true), (Some(500), Some(0)));
        assert_eq!(reconcile_range(Some(900), None, Some(&checkpoint), false), (Some(900), None));
        assert_eq!(reconcile_range(None, None, None, true), (None, None));
    }

    #[test]
    fn test_key_query() {
        let key = CheckpointKey {
            crawler_type: "historical_crawler".into(),
            blockchain: Blockchain::Polygon,
            abi_set_hash: "ab12".into(),
        };
        assert_eq!(key.query(), "#checkpoint #historical_crawler #polygon #abi_set_hash:ab12");
    }
}
