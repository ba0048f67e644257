//! Block-row ingestion over an ascending or descending range.

use tracing::info;

use crate::chain::{ChainBlock, ChainClient};
use crate::db::Datastore;
use crate::error::Result;
use crate::ranges::get_batch_block_range;
use crate::types::BlockRow;

pub fn block_row(block: &ChainBlock) -> BlockRow {
    BlockRow {
        block_number: block.number,
        block_hash: block.hash.to_string(),
        parent_hash: block.parent_hash.to_string(),
        timestamp: block.timestamp,
        transactions_count: block.transactions_count,
        l1_block_number: block.l1_block_number,
        mix_hash: block.mix_hash.map(|h| h.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCrawlSummary {
    pub batches: usize,
    pub fetched: usize,
    pub inserted: usize,
}

/// Fetch every block in `[from_block, to_block]` and store it, one commit per batch.
///
/// Blocks already present are skipped by the datastore.
pub async fn crawl_blocks(
    chain: &dyn ChainClient,
    store: &mut dyn Datastore,
    from_block: u64,
    to_block: u64,
    batch_size: u64,
) -> Result<BlockCrawlSummary> {
    let mut summary = BlockCrawlSummary::default();

    for (batch_start, batch_end) in get_batch_block_range(from_block, to_block, batch_size) {
        let numbers: Vec<u64> = if batch_start <= batch_end {
            (batch_start..=batch_end).collect()
        } else {
            (batch_end..=batch_start).rev().collect()
        };

        let mut rows = Vec::with_capacity(numbers.len());
        for number in numbers {
            let block = chain.get_block(number, false).await?;
            rows.push(block_row(&block));
        }

        let inserted = match store.upsert_blocks(&rows).await {
            Ok(inserted) => inserted,
            Err(e) => {
                store.rollback().await?;
                return Err(e);
            }
        };
        store.commit().await?;

        info!(
            "Stored blocks {}..{}: {} new of {}",
            batch_start,
            batch_end,
            inserted,
            rows.len()
        );
        summary.batches += 1;
        summary.fetched += rows.len();
        summary.inserted += inserted;
    }

    Ok(summary)
}
