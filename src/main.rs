use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use streamscore::config::EngineConfig;
use streamscore::model::{EwmaParams, ModelParams};
use streamscore::service::{metric_model_definition, parse_records_csv};

#[derive(Parser)]
#[command(
    name = "streamscore",
    about = "Online anomaly likelihood scoring for metric streams",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (overrides STREAMSCORE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations
    Init,

    /// Register a metric and define its model
    CreateMetric {
        /// Metric id
        #[arg(long)]
        id: String,

        /// Human-readable name
        #[arg(long)]
        name: String,

        /// EWMA smoothing factor
        #[arg(long, default_value = "0.1")]
        alpha: f64,

        /// Prediction error, in mean absolute deviations, that scores 1.0
        #[arg(long, default_value = "4.0")]
        sensitivity: f64,

        /// Aggregation period of the metric in seconds
        #[arg(long)]
        aggregation_secs: Option<i64>,
    },

    /// Score a batch of `row_id,timestamp,value` rows from a CSV file
    Ingest {
        /// Metric id
        #[arg(long)]
        metric: String,

        /// Input CSV file
        #[arg(long)]
        input: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Delete a metric, its rows and its model
    Delete {
        /// Metric id
        #[arg(long)]
        metric: String,
    },

    /// Show metrics and their likelihood state
    Status,
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Init => {
            streamscore::open_service(&config)?;
            println!("Database ready at {}", config.storage.db_path.display());
        }
        Commands::CreateMetric {
            id,
            name,
            alpha,
            sensitivity,
            aggregation_secs,
        } => {
            tracing::info!(%id, %name, alpha, sensitivity, ?aggregation_secs, "Creating metric");
            let service = streamscore::open_service(&config)?;
            let definition = metric_model_definition(
                ModelParams::Ewma(EwmaParams { alpha, sensitivity }),
                aggregation_secs,
            );
            service.create_metric(&id, &name, definition)?;
            println!("Metric '{}' created.", id);
        }
        Commands::Ingest {
            metric,
            input,
            json,
        } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let records = parse_records_csv(&text)?;
            tracing::info!(%metric, rows = records.len(), "Ingesting batch");

            let service = streamscore::open_service(&config)?;
            let report = service.process_batch(&metric, records).await?;
            service.shutdown()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Metric:             {}", report.metric_id);
                println!("Rows received:      {}", report.received);
                println!("Duplicates skipped: {}", report.duplicates);
                println!("Scored:             {}", report.scored);
                println!("Awaiting history:   {}", report.unscored);
                match report.last_row_id_for_stats {
                    Some(id) => println!("Stats refreshed at: row {}", id),
                    None => println!("Stats refreshed at: (not yet)"),
                }
                if let Some(max) = report.max_anomaly_score {
                    println!("Max anomaly score:  {:.5}", max);
                }
            }
        }
        Commands::Delete { metric } => {
            let service = streamscore::open_service(&config)?;
            service.delete_metric(&metric)?;
            println!("Metric '{}' deleted.", metric);
        }
        Commands::Status => {
            let service = streamscore::open_service(&config)?;
            let repo = service.repository();
            let metrics = repo.list_metrics()?;
            if metrics.is_empty() {
                println!("No metrics found.");
            } else {
                println!("{:<20} | {:<15} | {:<10} | Stats row", "Metric", "Status", "Last row");
                println!("{:-<20}-|-{:-<15}-|-{:-<10}-|-{:-<10}", "", "", "", "");
                for m in metrics {
                    let last_row = repo
                        .last_row_id(&m.id)?
                        .map_or_else(|| "-".to_string(), |v| v.to_string());
                    let stats_row = m
                        .model_params
                        .anomaly_likelihood_params
                        .as_ref()
                        .map_or_else(|| "-".to_string(), |p| p.last_row_id_for_stats.to_string());
                    println!("{:<20} | {:<15} | {:<10} | {}", m.id, m.status.to_string(), last_row, stats_row);
                }
            }
        }
    }

    Ok(())
}
