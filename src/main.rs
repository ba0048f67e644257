use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use evm_label_crawler::blocks::crawl_blocks;
use evm_label_crawler::chain::{retry_connect, HttpConnector, ReconnectPolicy};
use evm_label_crawler::cli::{Cli, Command, LogFormat};
use evm_label_crawler::config::AppCfg;
use evm_label_crawler::db::PgDatastore;
use evm_label_crawler::jobs::{self, HISTORICAL_FINISHED_TAG};
use evm_label_crawler::journal::{HttpJournal, JobJournal};
use evm_label_crawler::scheduler::continuous::CONTINUOUS_CRAWLER_TYPE;
use evm_label_crawler::scheduler::historical::HISTORICAL_CRAWLER_TYPE;
use evm_label_crawler::scheduler::{
    ContinuousCrawler, ContinuousParams, CrawlerContext, HistoricalCrawler, HistoricalParams,
};
use evm_label_crawler::{BlockTimestampCache, IngestionWriter};

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Compact => tracing_subscriber::fmt().with_env_filter(filter).compact().init(),
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }
}

async fn build_context(
    cfg: &AppCfg,
    crawler_type: &str,
    connector: HttpConnector,
    reconnect: ReconnectPolicy,
    store: PgDatastore,
    jobs_journal: Arc<dyn JobJournal>,
) -> Result<CrawlerContext> {
    let state_journal: Arc<dyn JobJournal> = Arc::new(HttpJournal::new(
        &cfg.journal.api_url,
        cfg.state_journal_id(),
        &cfg.journal.token,
        cfg.journal_timeout(),
    )?);

    let mut ctx = CrawlerContext::connect(
        cfg.chain.blockchain,
        crawler_type,
        Box::new(connector),
        reconnect,
        Box::new(store),
        jobs_journal,
        state_journal,
        IngestionWriter::new(cfg.crawler.label_name.clone(), cfg.crawler.max_insert_batch),
        BlockTimestampCache::new(cfg.crawler.db_block_query_batch),
    )
    .await?;
    ctx.failure_ceiling = cfg.crawler.failure_ceiling;
    Ok(ctx)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let mut cfg = AppCfg::load(cli.config.as_deref())?;
    if let Some(blockchain) = cli.blockchain {
        cfg.chain.blockchain = blockchain;
    }
    if let Some(web3) = cli.web3 {
        cfg.chain.http_rpc_url = web3;
    }
    let blockchain = cfg.chain.blockchain;
    info!("Configuration loaded for {}", blockchain);

    let schema = match &cfg.postgres.schema {
        Some(path) => Some(std::fs::read_to_string(Path::new(path))?),
        None => None,
    };
    let mut store = PgDatastore::connect(&cfg.postgres.dsn, blockchain, schema.as_deref()).await?;

    let connector = HttpConnector {
        rpc_url: cfg.chain.http_rpc_url.clone(),
        blockchain,
        poa: cli.poa || cfg.chain.poa.unwrap_or(false),
    };
    let reconnect = ReconnectPolicy {
        attempts: cfg.crawler.reconnect_attempts,
        sleep: cfg.reconnect_sleep(),
    };

    match cli.command {
        Command::Blocks(args) => {
            let client = retry_connect(&connector, blockchain, &reconnect).await?;
            let end = match args.end {
                Some(end) => end,
                None => client.get_block_number().await?.saturating_sub(args.confirmations),
            };
            let summary = crawl_blocks(client.as_ref(), &mut store, args.start, end, args.batch_size).await?;
            info!(
                "Block crawl done: {} batches, {} blocks fetched, {} stored",
                summary.batches, summary.fetched, summary.inserted
            );
        }
        Command::Continuous(args) => {
            let jobs_journal: Arc<dyn JobJournal> = Arc::new(HttpJournal::new(
                &cfg.journal.api_url,
                &cfg.journal.jobs_journal_id,
                &cfg.journal.token,
                cfg.journal_timeout(),
            )?);
            let (event_jobs, function_jobs) = jobs::load_jobs(jobs_journal.as_ref(), blockchain, &[]).await?;

            let ctx = build_context(&cfg, CONTINUOUS_CRAWLER_TYPE, connector, reconnect, store, jobs_journal).await?;
            let params = ContinuousParams {
                start_block: args.start,
                max_blocks_batch: args.max_blocks_batch,
                min_blocks_batch: args.min_blocks_batch,
                confirmations: args.confirmations,
                min_sleep_time: args.min_sleep_time,
                heartbeat_interval: args.heartbeat_interval,
                new_jobs_refetch_interval: args.new_jobs_refetch_interval,
                use_tracker: args.use_tracker,
                job_filters: Vec::new(),
            };

            let mut crawler = ContinuousCrawler::new(ctx, params, event_jobs, function_jobs).await?;
            // Only returns once the crawler is dead
            crawler.run().await?;
        }
        Command::Historical(args) => {
            let jobs_journal: Arc<dyn JobJournal> = Arc::new(HttpJournal::new(
                &cfg.journal.api_url,
                &cfg.journal.jobs_journal_id,
                &cfg.journal.token,
                cfg.journal_timeout(),
            )?);
            let filters = if args.include_finished {
                Vec::new()
            } else {
                vec![format!("!#{}", HISTORICAL_FINISHED_TAG)]
            };
            let (mut event_jobs, mut function_jobs) =
                jobs::load_jobs(jobs_journal.as_ref(), blockchain, &filters).await?;
            if args.only_events {
                function_jobs.clear();
            }
            if args.only_functions {
                event_jobs.clear();
            }

            let ctx = build_context(&cfg, HISTORICAL_CRAWLER_TYPE, connector, reconnect, store, jobs_journal).await?;
            let params = HistoricalParams {
                start_block: args.start,
                end_block: args.end,
                max_blocks_batch: args.max_blocks_batch,
                min_blocks_batch: args.min_blocks_batch,
                min_sleep_time: args.min_sleep_time,
                heartbeat_interval: args.heartbeat_interval,
                use_tracker: args.use_tracker,
                find_deployed_blocks: args.find_deployed_blocks,
            };

            let mut crawler = HistoricalCrawler::new(ctx, params, event_jobs, function_jobs).await?;
            let summary = crawler.run().await?;
            info!(
                "Historical crawl done: {} batches, {} events, {} calls",
                summary.batches.len(),
                summary.events_written,
                summary.calls_written
            );
        }
    }

    Ok(())
}
