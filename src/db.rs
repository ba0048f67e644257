use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::blockchain::Blockchain;
use crate::error::{CrawlerError, Result};
use crate::types::{BlockRow, LabelRow};

/// Transactional datastore over the per-chain blocks and labels tables.
///
/// Writes are staged in an open session until `commit`; `rollback` discards them.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// `(transaction_hash, log_index)` of event labels already stored under `label`.
    async fn existing_event_keys(&self, label: &str, tx_hashes: &[String]) -> Result<Vec<(String, u64)>>;

    /// Transaction hashes of function-call labels (no log index) already stored under `label`.
    async fn existing_call_hashes(&self, label: &str, tx_hashes: &[String]) -> Result<Vec<String>>;

    async fn insert_labels(&mut self, labels: &[LabelRow]) -> Result<()>;

    /// `(block_number, timestamp)` of indexed blocks in `[from_block, to_block]`, ascending.
    async fn block_timestamps(&self, from_block: u64, to_block: u64) -> Result<Vec<(u64, u64)>>;

    /// Insert blocks, skipping numbers already present. Returns the number inserted.
    async fn upsert_blocks(&mut self, blocks: &[BlockRow]) -> Result<usize>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Default schema for one chain's tables.
pub fn schema_sql(blockchain: Blockchain) -> String {
    let blocks = blockchain.blocks_table();
    let labels = blockchain.labels_table();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {blocks} (
            block_number BIGINT PRIMARY KEY,
            block_hash TEXT NOT NULL,
            parent_hash TEXT NOT NULL,
            timestamp BIGINT NOT NULL,
            transactions_count BIGINT NOT NULL DEFAULT 0,
            l1_block_number BIGINT,
            mix_hash TEXT,
            indexed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE INDEX IF NOT EXISTS ix_{blocks}_timestamp ON {blocks} (timestamp);

        CREATE TABLE IF NOT EXISTS {labels} (
            id UUID PRIMARY KEY,
            label TEXT NOT NULL,
            block_number BIGINT NOT NULL,
            block_timestamp BIGINT NOT NULL,
            address TEXT NOT NULL,
            transaction_hash TEXT NOT NULL,
            log_index BIGINT,
            label_data JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE INDEX IF NOT EXISTS ix_{labels}_label_tx ON {labels} (label, transaction_hash);
        CREATE INDEX IF NOT EXISTS ix_{labels}_block_number ON {labels} (block_number);
        "#
    )
}

pub async fn connect_pg(dsn: &str, schema: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Postgres connection error: {:?}", e);
        }
    });

    // Create schema if not exists
    client.batch_execute(schema).await?;

    info!("Postgres ready");

    Ok(client)
}

/// Postgres datastore bound to one chain's tables.
pub struct PgDatastore {
    client: Client,
    blocks_table: String,
    labels_table: String,
    in_transaction: bool,
}

impl PgDatastore {
    pub fn new(client: Client, blockchain: Blockchain) -> Self {
        Self {
            client,
            blocks_table: blockchain.blocks_table(),
            labels_table: blockchain.labels_table(),
            in_transaction: false,
        }
    }

    pub async fn connect(dsn: &str, blockchain: Blockchain, schema: Option<&str>) -> Result<Self> {
        let default_schema = schema_sql(blockchain);
        let client = connect_pg(dsn, schema.unwrap_or(&default_schema)).await?;
        Ok(Self::new(client, blockchain))
    }

    async fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.client.batch_execute("BEGIN").await?;
            self.in_transaction = true;
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn existing_event_keys(&self, label: &str, tx_hashes: &[String]) -> Result<Vec<(String, u64)>> {
        if tx_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT transaction_hash, log_index FROM {} \
             WHERE label = $1 AND log_index IS NOT NULL AND transaction_hash = ANY($2)",
            self.labels_table
        );
        let rows = self.client.query(query.as_str(), &[&label, &tx_hashes]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let log_index: i64 = row.get(1);
                (row.get::<_, String>(0), log_index as u64)
            })
            .collect())
    }

    async fn existing_call_hashes(&self, label: &str, tx_hashes: &[String]) -> Result<Vec<String>> {
        if tx_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT DISTINCT transaction_hash FROM {} \
             WHERE label = $1 AND log_index IS NULL AND transaction_hash = ANY($2)",
            self.labels_table
        );
        let rows = self.client.query(query.as_str(), &[&label, &tx_hashes]).await?;

        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn insert_labels(&mut self, labels: &[LabelRow]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        self.begin().await?;

        let query = format!(
            "INSERT INTO {} (id, label, block_number, block_timestamp, address, transaction_hash, log_index, label_data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8::jsonb)",
            self.labels_table
        );
        let statement = self.client.prepare(query.as_str()).await?;

        for label in labels {
            let log_index = label.log_index.map(|i| i as i64);
            self.client
                .execute(
                    &statement,
                    &[
                        &uuid::Uuid::new_v4(),
                        &label.label,
                        &(label.block_number as i64),
                        &(label.block_timestamp as i64),
                        &label.address,
                        &label.transaction_hash,
                        &log_index,
                        &label.label_data,
                    ],
                )
                .await?;
        }

        debug!("Staged {} labels into {}", labels.len(), self.labels_table);
        Ok(())
    }

    async fn block_timestamps(&self, from_block: u64, to_block: u64) -> Result<Vec<(u64, u64)>> {
        let query = format!(
            "SELECT block_number, timestamp FROM {} \
             WHERE block_number >= $1 AND block_number <= $2 ORDER BY block_number ASC",
            self.blocks_table
        );
        let rows = self
            .client
            .query(query.as_str(), &[&(from_block as i64), &(to_block as i64)])
            .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<_, i64>(0) as u64, row.get::<_, i64>(1) as u64))
            .collect())
    }

    async fn upsert_blocks(&mut self, blocks: &[BlockRow]) -> Result<usize> {
        if blocks.is_empty() {
            return Ok(0);
        }
        self.begin().await?;

        let query = format!(
            "INSERT INTO {} (block_number, block_hash, parent_hash, timestamp, transactions_count, l1_block_number, mix_hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (block_number) DO NOTHING",
            self.blocks_table
        );
        let statement = self.client.prepare(query.as_str()).await?;

        let mut inserted = 0usize;
        for block in blocks {
            let l1_block_number = block.l1_block_number.map(|n| n as i64);
            let result = self
                .client
                .execute(
                    &statement,
                    &[
                        &(block.block_number as i64),
                        &block.block_hash,
                        &block.parent_hash,
                        &(block.timestamp as i64),
                        &(block.transactions_count as i64),
                        &l1_block_number,
                        &block.mix_hash,
                    ],
                )
                .await;

            match result {
                Ok(count) => inserted += count as usize,
                Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                    warn!("Block {} already exists, skipping", block.block_number);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.client.batch_execute("COMMIT").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            // Leave the flag cleared even if the server already aborted the transaction
            self.in_transaction = false;
            self.client
                .batch_execute("ROLLBACK")
                .await
                .map_err(|e| CrawlerError::Database(format!("Rollback failed: {}", e)))?;
        }
        Ok(())
    }
}
