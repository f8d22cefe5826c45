use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regrec_core::Period;
use regrec_sync::{open_configured_store, EngineConfig, SyncPipeline};
use regrec_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "regrec-cli")]
#[command(about = "Reconcile portal report listings against warehouse imports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pass for a family and period.
    Sync {
        #[arg(long)]
        family: String,
        #[arg(long, value_parser = parse_period)]
        period: Period,
        /// Saved listing page to use instead of the live portal.
        #[arg(long)]
        html_file: Option<PathBuf>,
    },
    /// List the periods that already have a table.
    Periods {
        #[arg(long)]
        family: String,
    },
    /// Serve the dashboard JSON API.
    Serve {
        #[arg(long)]
        html_file: Option<PathBuf>,
    },
}

fn parse_period(value: &str) -> Result<Period, String> {
    Period::parse(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("regrec=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("loading configuration")?;
    let (config, store) = open_configured_store(config)
        .await
        .context("opening local store")?;

    match cli.command {
        Commands::Sync {
            family,
            period,
            html_file,
        } => {
            let pipeline = SyncPipeline::from_config(config, store, html_file).await?;
            let summary = pipeline.run_pass(&family, &period).await?;
            println!(
                "pass complete: run_id={} entries={} accepted={} rejected={} inserted={} updated={} unchanged={} reports={}",
                summary.run_id,
                summary.entry_stats.accepted,
                summary.matches.accepted,
                summary.matches.rejected,
                summary.totals.inserted,
                summary.totals.updated,
                summary.totals.unchanged,
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Periods { family } => {
            let family = config.families.require(&family)?;
            for table in store.list_period_tables(&family.table_prefix).await? {
                println!("{}\t{}", table.period(), table.name());
            }
        }
        Commands::Serve { html_file } => {
            let mut state = AppState::new(config, store);
            if let Some(path) = html_file {
                state = state.with_listing_file(path);
            }
            info!(port = state.config.web_port, "starting dashboard api");
            regrec_web::serve(state).await?;
        }
    }

    Ok(())
}
