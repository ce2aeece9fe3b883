use anyhow::Result;
use clap::{Parser, Subcommand};
use paddock_sync::{describe_store, report_recent_runs, RunOverrides, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "paddock")]
#[command(about = "Track racing engagements and results across scrapes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled source against its seen store and notify.
    Sync {
        /// Report every row as new.
        #[arg(long)]
        force: bool,
        /// Treat this run as the first of the day.
        #[arg(long, conflicts_with = "not_first_of_period")]
        first_of_period: bool,
        /// Treat this run as a later run of the day.
        #[arg(long)]
        not_first_of_period: bool,
        /// Only sync this source (even if disabled).
        #[arg(long)]
        source: Option<String>,
    },
    /// Show the most recently updated seen entries of a source.
    Store {
        #[arg(long)]
        source: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        force: false,
        first_of_period: false,
        not_first_of_period: false,
        source: None,
    }) {
        Commands::Sync {
            force,
            first_of_period,
            not_first_of_period,
            source,
        } => {
            let overrides = RunOverrides {
                force,
                first_of_period: match (first_of_period, not_first_of_period) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                only_source: source,
                now: None,
            };
            let summary = SyncPipeline::new(config).run_once(overrides).await?;
            eprintln!(
                "sync complete: run_id={} sources={} new={} changed={} confirmed={} reports={}",
                summary.run_id,
                summary.sources.len(),
                summary.total_new(),
                summary.total_changed(),
                summary.total_confirmed(),
                summary.reports_dir
            );
        }
        Commands::Store { source, limit } => {
            println!("{}", describe_store(&config, &source, limit).await?);
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(runs, &config)?);
        }
    }

    Ok(())
}
