mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use judge_common::store::RedisStore;
use judge_common::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "judge-cli")]
#[command(about = "Judge CLI - Enqueue jobs and inspect the judge queue", long_about = None)]
struct Cli {
    /// Redis URL (defaults to REDIS_URL or redis://127.0.0.1:6379)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Key prefix (defaults to REDIS_KEY_PREFIX or "judge")
    #[arg(long, global = true)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RequestKind {
    Validation,
    Grading,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a pending job built from a JSON detail file
    Enqueue {
        /// Which request table the result goes back to
        #[arg(short, long, value_enum)]
        kind: RequestKind,

        /// Id of the originating request
        #[arg(short, long)]
        request_id: i64,

        /// Path to the job detail JSON
        #[arg(short, long)]
        detail: PathBuf,
    },

    /// Show queue depth by status
    Status,

    /// Print one job as JSON
    Show {
        #[arg(short, long)]
        job_id: i64,
    },

    /// List jobs in one status, least recently updated first
    List {
        /// pending, fetched, processing, done or failed
        #[arg(short, long)]
        status: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Return stale jobs to pending
    Reclaim {
        /// processing or fetched
        #[arg(short, long, default_value = "processing")]
        from: String,

        /// Only jobs older than this many seconds
        #[arg(long, default_value = "600")]
        stale_after_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }
    if let Some(prefix) = cli.prefix {
        config.key_prefix = prefix;
    }
    let store = RedisStore::connect(&config).await?;

    match cli.command {
        Commands::Enqueue {
            kind,
            request_id,
            detail,
        } => {
            commands::enqueue(&store, kind, request_id, &detail).await?;
        }
        Commands::Status => {
            commands::status(&store).await?;
        }
        Commands::Show { job_id } => {
            commands::show(&store, job_id).await?;
        }
        Commands::List { status, limit } => {
            commands::list(&store, &status, limit).await?;
        }
        Commands::Reclaim {
            from,
            stale_after_secs,
        } => {
            commands::reclaim(&store, &from, stale_after_secs).await?;
        }
    }

    Ok(())
}
