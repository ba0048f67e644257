//! EVM label crawler library
//!
//! Crawls EVM chains for contract events and top-level function calls described by
//! jobs in an external journal, and writes them as deduplicated label rows into
//! per-chain Postgres tables.
//!
//! # Features
//!
//! - Job registry built from journal entries, merged on refresh without duplicates
//! - Forward (continuous) and backward (historical) crawl schedulers
//! - Idempotent ingestion keyed by `(transaction_hash, log_index)` or `transaction_hash`
//! - Heartbeats, pick-up and progress tags, checkpoints kept in the journal
//! - Block-row crawler for the per-chain blocks table
//!
//! Chain, datastore and journal access sit behind the [`ChainClient`], [`Datastore`]
//! and [`JobJournal`] traits, so schedulers can run against in-memory fakes.

pub mod abi;
pub mod blockchain;
pub mod blocks;
pub mod chain;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod heartbeat;
pub mod jobs;
pub mod journal;
pub mod ranges;
pub mod scheduler;
pub mod timestamps;
pub mod types;
pub mod writer;

pub use blockchain::Blockchain;
pub use chain::{ChainBlock, ChainClient, ChainConnector, ChainLog, ChainReceipt, ChainTransaction, LogFilter};
pub use db::Datastore;
pub use error::{CrawlerError, Result, StepOutcome};
pub use jobs::{EventCrawlJob, FunctionCallCrawlJob};
pub use journal::JobJournal;
pub use ranges::get_batch_block_range;
pub use scheduler::{ContinuousCrawler, CrawlerContext, HistoricalCrawler};
pub use timestamps::BlockTimestampCache;
pub use types::{BlockRow, Event, FunctionCall, JournalEntry, LabelRow};
pub use writer::IngestionWriter;
