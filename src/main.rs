mod catalog;
mod cli;
mod config;
mod error;
mod fetch;
mod models;
mod pipeline;
mod playlist;
mod schedule;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{Config, apply_env_overrides, load_config, validate_config};
use crate::fetch::Fetcher;
use crate::pipeline::StageOutcome;
use crate::schedule::{Extractor, ScheduleExtractor};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_exists = cli.config.exists();
    let mut config = if config_exists {
        load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?
    } else {
        Config::default()
    };

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config_exists {
        info!(config_path = %cli.config.display(), "config loaded");
    } else {
        info!(config_path = %cli.config.display(), "no config file, using defaults");
    }
    apply_env_overrides(&mut config).context("reading environment overrides")?;

    validate_config(&config).context("config validation failed")?;

    let (run_schedule, run_catalog) = match cli.command.unwrap_or(Commands::All) {
        Commands::Validate => {
            println!("Configuration is valid.");
            return Ok(());
        }
        Commands::Extract { input, output } => {
            let html = std::fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
            let extractor = ScheduleExtractor::new(&config.schedule.selectors)?;
            let doc = extractor.extract(&html);
            if doc.is_empty() {
                warn!(input = %input.display(), "no schedule found in input");
            }
            let json = playlist::render_schedule(&doc).context("serializing schedule")?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &json).with_context(|| format!("writing {}", path.display()))?;
                    println!("Schedule written to: {}", path.display());
                }
                None => println!("{json}"),
            }
            return Ok(());
        }
        Commands::Schedule => (config.schedule.enabled, false),
        Commands::Catalog => (false, config.catalog.enabled),
        Commands::All => (config.schedule.enabled, config.catalog.enabled),
    };

    let fetcher = Fetcher::from_config(&config.fetch, &config.challenge)?;

    let mut outcomes: Vec<StageOutcome> = Vec::new();

    if run_schedule {
        let extractor = ScheduleExtractor::new(&config.schedule.selectors)?;
        info!(selectors = extractor.version(), "schedule extractor ready");
        outcomes.push(pipeline::run_schedule(&config.schedule, &fetcher, &extractor).await);
        if let Some(outcome) = pipeline::run_channels_page(&config.schedule, &fetcher).await {
            outcomes.push(outcome);
        }
    }

    if run_catalog {
        outcomes.push(pipeline::run_catalog(&config.catalog, &fetcher, Utc::now()).await);
    }

    if outcomes.is_empty() {
        anyhow::bail!("nothing to do: the requested stage is disabled in config");
    }

    for outcome in &outcomes {
        let status = if outcome.ok { "ok" } else { "FAILED" };
        println!("[{}] {}: {}", outcome.stage, status, outcome.detail);
    }

    if outcomes.iter().all(|o| !o.ok) {
        anyhow::bail!("every stage failed");
    }
    if outcomes.iter().any(|o| !o.ok) {
        warn!("completed with failed stages");
    } else {
        info!("completed without errors");
    }

    Ok(())
}
