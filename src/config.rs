use std::time::Duration;

use serde::Deserialize;

use crate::blockchain::Blockchain;
use crate::error::{CrawlerError, Result};
use crate::writer::{DEFAULT_LABEL_NAME, DEFAULT_MAX_INSERT_BATCH};

#[derive(Debug, Deserialize, Clone)]
pub struct ChainCfg {
    pub blockchain: Blockchain,
    pub http_rpc_url: String,
    pub poa: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PgCfg {
    pub dsn: String,
    /// Path to a schema file executed instead of the built-in per-chain schema
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JournalCfg {
    pub api_url: String,
    pub token: String,
    pub jobs_journal_id: String,
    /// Journal for heartbeats and checkpoints; the jobs journal when unset
    pub state_journal_id: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerCfg {
    pub label_name: String,
    pub max_insert_batch: usize,
    /// Block rows fetched per timestamp cache query
    pub db_block_query_batch: u64,
    pub reconnect_attempts: usize,
    pub reconnect_sleep_secs: u64,
    pub failure_ceiling: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppCfg {
    pub name: Option<String>,
    pub chain: ChainCfg,
    pub postgres: PgCfg,
    pub journal: JournalCfg,
    pub crawler: CrawlerCfg,
}

impl AppCfg {
    /// Load from a YAML file (optional), overlaid with `CRAWLER__SECTION__KEY` variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        // Load .env file first
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder()
            .set_default("journal.api_url", "https://spire.bugout.dev")
            .and_then(|b| b.set_default("journal.timeout_secs", 30))
            .and_then(|b| b.set_default("crawler.label_name", DEFAULT_LABEL_NAME))
            .and_then(|b| b.set_default("crawler.max_insert_batch", DEFAULT_MAX_INSERT_BATCH as i64))
            .and_then(|b| b.set_default("crawler.db_block_query_batch", 100))
            .and_then(|b| b.set_default("crawler.reconnect_attempts", 10))
            .and_then(|b| b.set_default("crawler.reconnect_sleep_secs", 5))
            .and_then(|b| b.set_default("crawler.failure_ceiling", 10))
            .map_err(config_error)?;

        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("config").required(false)),
        };

        let cfg: Self = builder
            .add_source(
                config::Environment::with_prefix("CRAWLER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.chain.http_rpc_url.is_empty() {
            return Err(CrawlerError::Configuration("chain.http_rpc_url is empty".to_string()));
        }
        if self.crawler.max_insert_batch == 0 || self.crawler.db_block_query_batch == 0 {
            return Err(CrawlerError::Configuration(
                "crawler batch sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_journal_id(&self) -> &str {
        self.journal
            .state_journal_id
            .as_deref()
            .unwrap_or(&self.journal.jobs_journal_id)
    }

    pub fn journal_timeout(&self) -> Duration {
        Duration::from_secs(self.journal.timeout_secs)
    }

    pub fn reconnect_sleep(&self) -> Duration {
        Duration::from_secs(self.crawler.reconnect_sleep_secs)
    }
}

fn config_error(e: config::ConfigError) -> CrawlerError {
    CrawlerError::Configuration(e.to_string())
}
