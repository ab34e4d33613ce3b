use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "prospect", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter, e.g. "debug" or "prospect_etl=debug" (default: $RUST_LOG or "info")
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Enrich a CSV of companies
    ///
    /// Each row is looked up by its company number and name:
    ///
    /// - Companies House profile, registered address and accounts filings
    /// - Employee counts from the filed accounts, per reporting period
    /// - The company's website, found by web search, and a description
    ///   scraped from it
    /// - Coordinates of the registered address
    ///
    /// The output is the input table with company_url, description,
    /// employees_<period> and manufacturing_location columns appended.
    /// Sources that fail leave their columns empty; the run carries on.
    ///
    /// Output is written in checkpoints. After Ctrl-C or a crash, rerun
    /// with --resume to continue after the last checkpoint without
    /// repeating finished rows. Responses are cached, so reruns over the
    /// same companies are cheap.
    Enrich {
        /// Input CSV file
        input: PathBuf,

        /// Output CSV file (default: <input>_enriched.csv)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Rows enriched concurrently
        #[arg(short, long, env = "PROSPECT_MAX_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Rows per checkpoint
        #[arg(long)]
        checkpoint: Option<usize>,

        /// Continue from the rows already in the output file
        #[arg(long)]
        resume: bool,

        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Describe an input CSV: columns, rows and how full each column is
    Info {
        /// Input CSV file
        input: PathBuf,
    },
    /// Manage the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Debug, clap::Subcommand)]
enum CacheAction {
    /// Show entry counts and size
    Stats,
    /// Remove expired entries
    Purge,
    /// Remove every entry
    Clear,
}

#[derive(Debug, clap::Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Print an example config file
    Example,
    /// Create the config file with defaults
    Init,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Enrich {
            input,
            out,
            concurrency,
            checkpoint,
            resume,
            no_cache,
        } => {
            let config = prospect_etl::Config::load()?;
            let args = commands::enrich::EnrichArgs {
                input,
                out,
                concurrency,
                checkpoint,
                resume,
                no_cache,
            };
            commands::run_enrich(config, args).await?;
        }
        Commands::Info { input } => {
            let config = prospect_etl::Config::load()?;
            commands::show_info(&config, &input)?;
        }
        Commands::Cache { action } => {
            let config = prospect_etl::Config::load()?;
            match action {
                CacheAction::Stats => commands::cache::show_stats(&config)?,
                CacheAction::Purge => commands::cache::purge(&config)?,
                CacheAction::Clear => commands::cache::clear(&config)?,
            }
        }
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config::show_config()?,
            ConfigAction::Path => commands::config::show_path()?,
            ConfigAction::Example => commands::config::show_example()?,
            ConfigAction::Init => commands::config::init_config()?,
        },
    }

    Ok(())
}
