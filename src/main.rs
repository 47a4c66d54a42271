use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use aisguard::config::{AppConfig, ValidationPolicy};

#[derive(Parser)]
#[command(
    name = "aisguard",
    about = "Abnormal vessel behaviour detection from AIS position reports",
    version,
    long_about = None
)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect abnormal behaviour in a report stream against a feature store
    Analyze {
        /// Decoded AIS reports, one JSON object per line
        #[arg(long)]
        input: PathBuf,

        /// Feature store built by `build-stats`
        #[arg(long)]
        stats: PathBuf,

        /// Event store (created if missing)
        #[arg(long, default_value = "aisguard-events.db")]
        events: PathBuf,
    },

    /// Fold historical reports into the statistical feature store
    BuildStats {
        /// Decoded AIS reports, one JSON object per line
        #[arg(long)]
        input: PathBuf,

        /// Feature store to create or extend
        #[arg(long, default_value = "aisguard-stats.db")]
        stats: PathBuf,

        /// Grid resolution in meters (new stores only)
        #[arg(long)]
        grid_resolution: Option<f64>,
    },

    /// Check a feature store against the analyses' format expectations
    ValidateStats {
        #[arg(long)]
        stats: PathBuf,
    },

    /// List the most recent abnormal behaviour events
    Events {
        #[arg(long, default_value = "aisguard-events.db")]
        events: PathBuf,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze {
            input,
            stats,
            events,
        } => {
            tracing::info!(input = %input.display(), "Starting analyzer");
            aisguard::run_analyzer(&input, &stats, &events, &config).await?;
        }
        Commands::BuildStats {
            input,
            stats,
            grid_resolution,
        } => {
            if let Some(resolution) = grid_resolution {
                config.grid_resolution_meters = resolution;
            }
            tracing::info!(input = %input.display(), "Building statistics");
            aisguard::run_stat_builder(&input, &stats, &config).await?;
        }
        Commands::ValidateStats { stats } => {
            let findings = aisguard::run_validation(&stats)?;
            if findings.is_empty() {
                println!("Feature store is valid.");
            } else {
                for finding in &findings {
                    println!("FINDING: {finding}");
                }
                if config.validation_policy == ValidationPolicy::Strict {
                    anyhow::bail!("feature store failed validation");
                }
            }
        }
        Commands::Events { events, limit } => {
            let repo = aisguard::events::repository::EventRepository::open(&events)?;
            let list = repo.recent_events(limit)?;
            if list.is_empty() {
                println!("No events recorded.");
            } else {
                println!("{:<38} | {:<20} | {:<8} | Title", "Id", "Type", "State");
                println!("{:-<38}-|-{:-<20}-|-{:-<8}-|-{:-<30}", "", "", "", "");
                for event in list {
                    println!(
                        "{:<38} | {:<20} | {:<8} | {}",
                        event.id,
                        event.event_type,
                        event.state.as_str(),
                        event.title
                    );
                }
            }
        }
    }

    Ok(())
}
