//! docstore-migrate CLI
//!
//! Migrates document-store collections into PostgreSQL tables.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use docstore_migrate::{CollectionRegistry, MigrationConfig, Orchestrator, RunOptions};

#[derive(Parser)]
#[command(name = "docstore-migrate")]
#[command(version)]
#[command(about = "Migrate document-store collections into PostgreSQL, in dependency order", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Source API base URL (overrides the config file)
    #[arg(long, env = "SOURCE_API_URL", global = true)]
    source_url: Option<String>,

    /// Source API bearer token (overrides the config file)
    #[arg(long, env = "SOURCE_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Destination connection string (overrides the config file)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    database_url: Option<String>,

    /// Fetch and transform only; never write, never halt on failure
    #[arg(long)]
    dry_run: bool,

    /// Migrate only this collection
    #[arg(long, value_name = "COLLECTION")]
    only: Option<String>,

    /// Leave this collection out
    #[arg(long, value_name = "COLLECTION")]
    skip: Option<String>,

    /// Stop after N records (requires --only)
    #[arg(long, value_name = "N", requires = "only")]
    max: Option<usize>,

    /// Print the final report as JSON after the summary table
    #[arg(long)]
    output_json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List collections in migration order
    List,

    /// Validate configuration without migrating anything
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Some(Commands::List) => {
            list_collections(&cli)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Validate) => {
            validate_config(&cli)?;
            Ok(ExitCode::SUCCESS)
        }
        None => run_migration(&cli).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MigrationConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            MigrationConfig::from_file(path)
                .with_context(|| format!("reading {}", path.display()))?
        }
        None => {
            let source = cli.source_url.clone().ok_or_else(|| {
                anyhow!("no --config given: set --source-url or SOURCE_API_URL")
            })?;
            let database = cli.database_url.clone().ok_or_else(|| {
                anyhow!("no --config given: set --database-url or DATABASE_URL")
            })?;
            MigrationConfig::from_urls(source, database)
        }
    };

    if let Some(url) = &cli.source_url {
        config.source.base_url = url.clone();
    }
    if let Some(key) = &cli.api_key {
        config.source.api_key = Some(key.clone());
    }
    if let Some(url) = &cli.database_url {
        config.destination.url = url.clone();
    }

    Ok(config)
}

async fn run_migration(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;
    let colors = console::colors_enabled();

    let mut orchestrator =
        Orchestrator::from_config(&config)?.with_progress(console::Term::stderr().is_term());

    let options = RunOptions {
        simulate: cli.dry_run,
        only: cli.only.clone(),
        skip: cli.skip.clone(),
        max_records: cli.max,
    };

    let report = orchestrator.run(&options).await?;

    println!();
    print!("{}", report.render(colors));

    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(report.exit_code())
}

fn validate_config(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    config.validate()?;
    let registry = config.registry()?;

    println!("Configuration is valid");
    println!("   Source:      {}", config.source.base_url);
    println!("   Schema:      {}", config.destination.schema);
    println!("   Collections: {}", registry.len());

    Ok(())
}

fn list_collections(cli: &Cli) -> anyhow::Result<()> {
    let registry = match &cli.config {
        Some(path) => MigrationConfig::from_file(path)?.registry()?,
        None => CollectionRegistry::builtin(),
    };

    println!(
        "{:>4}  {:<22} {:<24} {:<22} {:>6} {:>8}",
        "Rank", "Collection", "Endpoint", "Table", "Batch", "Delay"
    );
    for descriptor in registry.iter() {
        println!(
            "{:>4}  {:<22} {:<24} {:<22} {:>6} {:>6}ms",
            descriptor.migration_rank,
            descriptor.name,
            descriptor.source_endpoint,
            descriptor.destination_table,
            descriptor.batch_size,
            descriptor.inter_batch_delay_ms
        );
    }

    Ok(())
}
