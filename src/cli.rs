//! CLI argument parsing

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::blockchain::Blockchain;

#[derive(Parser, Debug)]
#[command(name = "evm-label-crawler")]
#[command(about = "Continuous and historical EVM event and function call crawler", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "CRAWLER_CONFIG")]
    pub config: Option<String>,

    /// Blockchain to crawl (overrides chain.blockchain)
    #[arg(short, long, value_enum)]
    pub blockchain: Option<Blockchain>,

    /// HTTP JSON-RPC URL (overrides chain.http_rpc_url)
    #[arg(long, env = "CRAWLER_WEB3")]
    pub web3: Option<String>,

    /// Treat the chain as proof-of-authority
    #[arg(long)]
    pub poa: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Follow the chain head and label new events and calls
    Continuous(ContinuousArgs),

    /// Crawl backwards from a recent block down to a deployment block
    Historical(HistoricalArgs),

    /// Store block rows for a range of blocks
    Blocks(BlocksArgs),
}

#[derive(Debug, Args)]
pub struct ContinuousArgs {
    /// First block to crawl (defaults to the safe chain head)
    #[arg(short, long)]
    pub start: Option<u64>,

    #[arg(long, default_value = "100")]
    pub max_blocks_batch: u64,

    #[arg(long, default_value = "10")]
    pub min_blocks_batch: u64,

    /// Blocks to stay behind the chain head
    #[arg(long, default_value = "60")]
    pub confirmations: u64,

    /// Minimum sleep between cycles, in seconds
    #[arg(long, default_value = "0.1")]
    pub min_sleep_time: f64,

    /// Seconds between heartbeats (and commits)
    #[arg(long, default_value = "60")]
    pub heartbeat_interval: f64,

    /// Seconds between job refreshes
    #[arg(long, default_value = "180")]
    pub new_jobs_refetch_interval: f64,

    /// Resume from the persisted checkpoint instead of --start
    #[arg(long)]
    pub use_tracker: bool,
}

#[derive(Debug, Args)]
pub struct HistoricalArgs {
    /// Block to crawl down from (defaults to the chain head)
    #[arg(short, long)]
    pub start: Option<u64>,

    /// Block to crawl down to
    #[arg(short, long)]
    pub end: Option<u64>,

    #[arg(long, default_value = "100")]
    pub max_blocks_batch: u64,

    /// Smallest log chunk for the auto-scaling event fetch
    #[arg(long, default_value = "10")]
    pub min_blocks_batch: u64,

    #[arg(long, default_value = "0.1")]
    pub min_sleep_time: f64,

    #[arg(long, default_value = "60")]
    pub heartbeat_interval: f64,

    #[arg(long)]
    pub use_tracker: bool,

    /// Look up contract deployment blocks for progress reporting
    #[arg(long)]
    pub find_deployed_blocks: bool,

    #[arg(long, conflicts_with = "only_functions")]
    pub only_events: bool,

    #[arg(long)]
    pub only_functions: bool,

    /// Also pick up jobs already tagged as finished
    #[arg(long)]
    pub include_finished: bool,
}

#[derive(Debug, Args)]
pub struct BlocksArgs {
    #[arg(short, long)]
    pub start: u64,

    /// Last block, may be below --start (defaults to the safe chain head)
    #[arg(short, long)]
    pub end: Option<u64>,

    #[arg(long, default_value = "100")]
    pub batch_size: u64,

    #[arg(long, default_value = "0")]
    pub confirmations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_historical() {
        let cli = Cli::parse_from([
            "evm-label-crawler",
            "--blockchain",
            "arbitrum-one",
            "historical",
            "--start",
            "1000",
            "--end",
            "0",
            "--only-events",
        ]);
        assert_eq!(cli.blockchain, Some(Blockchain::ArbitrumOne));
        match cli.command {
            Command::Historical(args) => {
                assert_eq!(args.start, Some(1000));
                assert_eq!(args.end, Some(0));
                assert!(args.only_events);
                assert_eq!(args.max_blocks_batch, 100);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_continuous_defaults() {
        let cli = Cli::parse_from(["evm-label-crawler", "continuous", "--use-tracker"]);
        match cli.command {
            Command::Continuous(args) => {
                assert!(args.use_tracker);
                assert_eq!(args.confirmations, 60);
                assert_eq!(args.min_sleep_time, 0.1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
