use std::collections::HashMap;

use tracing::debug;

use crate::chain::ChainClient;
use crate::db::Datastore;
use crate::error::Result;

/// Memoized block timestamps: in-memory map, then a block-table range query,
/// then a direct chain call.
///
/// Owned by one scheduler and passed by reference to the fetchers. Memory is
/// bounded by resetting the map once it outgrows a few query batches.
#[derive(Debug)]
pub struct BlockTimestampCache {
    cache: HashMap<u64, u64>,
    max_batch: u64,
}

impl BlockTimestampCache {
    pub fn new(max_batch: u64) -> Self {
        Self {
            cache: HashMap::new(),
            max_batch: max_batch.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn max_batch(&self) -> u64 {
        self.max_batch
    }

    /// Timestamp of `block_number`; chain errors propagate without retry.
    pub async fn get_timestamp(
        &mut self,
        block_number: u64,
        store: &dyn Datastore,
        chain: &dyn ChainClient,
    ) -> Result<u64> {
        if let Some(timestamp) = self.cache.get(&block_number) {
            return Ok(*timestamp);
        }

        let batch_end = block_number.saturating_add(self.max_batch - 1);
        let rows = store.block_timestamps(block_number, batch_end).await?;

        if (self.cache.len() + rows.len()) as u64 > self.max_batch * 2 {
            debug!("Resetting block timestamp cache at {} entries", self.cache.len());
            self.cache.clear();
        }
        self.cache.extend(rows);

        if let Some(timestamp) = self.cache.get(&block_number) {
            return Ok(*timestamp);
        }

        // Block not indexed yet
        let block = chain.get_block(block_number, false).await?;
        self.cache.insert(block_number, block.timestamp);
        Ok(block.timestamp)
    }

    /// Warm the cache for a whole crawl window `[from_block, to_block]` with one query.
    pub async fn prefetch(&mut self, from_block: u64, to_block: u64, store: &dyn Datastore) -> Result<usize> {
        let (low, high) = if from_block <= to_block {
            (from_block, to_block)
        } else {
            (to_block, from_block)
        };
        let window_start = low.saturating_sub(self.max_batch + 1);
        let window_end = high.saturating_add(self.max_batch + 1);
        let rows = store.block_timestamps(window_start, window_end).await?;

        if (self.cache.len() + rows.len()) as u64 > self.max_batch * 3 + 2 {
            debug!("Resetting block timestamp cache at {} entries", self.cache.len());
            self.cache.clear();
        }
        let fetched = rows.len();
        self.cache.extend(rows);

        Ok(fetched)
    }
}
