//! Operator entry point for the Meterline usage core

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use meterline_common::{format_timestamp, parse_timestamp};
use meterline_usage::domain::{EntityId, EntityType, TenantId};
use meterline_usage::replay::replay_lines;
use meterline_usage::{UsageConfig, UsageService};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meterline-usage", about = "Meterline usage-period tracking", version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    gen_config: bool,

    /// Validate configuration without touching storage
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Apply a JSON-lines file of lifecycle events in order
    Replay { file: PathBuf },
    /// List the periods of a tenant active in [start, end)
    Periods {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, value_enum)]
        entity_type: Option<EntityTypeArg>,
    },
    /// Print every period recorded for one entity
    History { entity_id: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EntityTypeArg {
    Instance,
    Volume,
}

impl From<EntityTypeArg> for EntityType {
    fn from(arg: EntityTypeArg) -> Self {
        match arg {
            EntityTypeArg::Instance => EntityType::Instance,
            EntityTypeArg::Volume => EntityType::Volume,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_filter = format!("{}=info", env!("CARGO_BIN_NAME").replace('-', "_"));
    meterline_common::logging::init_logging(&args.verbosity, &log_filter)?;

    if args.gen_config {
        println!("{}", UsageConfig::generate_example()?);
        return Ok(());
    }

    let config = UsageConfig::load(args.config)?;
    info!(
        "Loaded configuration for {} ({}), backend {:?}",
        config.service.service_id, config.service.environment, config.storage.backend
    );

    if args.dry_run {
        info!("Configuration validated successfully (dry-run mode)");
        return Ok(());
    }

    let Some(command) = args.command else {
        return Err(anyhow!("no command given, see --help"));
    };

    let service = UsageService::from_config(&config).await?;

    match command {
        Command::Migrate => {
            service.run_migrations().await?;
        }
        Command::Replay { file } => {
            let input = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let summary = replay_lines(&service.controller, &input).await;

            println!(
                "applied: {}, unchanged: {}, rejected: {}",
                summary.applied,
                summary.unchanged,
                summary.rejected.len()
            );
            for rejected in &summary.rejected {
                println!(
                    "  line {}: [{}] {}",
                    rejected.line,
                    rejected.error.error_code(),
                    rejected.error
                );
            }
        }
        Command::Periods {
            tenant,
            start,
            end,
            entity_type,
        } => {
            let periods = service
                .queries
                .list_periods(
                    &TenantId::new(tenant),
                    parse_timestamp(&start)?,
                    parse_timestamp(&end)?,
                    entity_type.map(EntityType::from),
                )
                .await?;

            for active in &periods {
                let period = &active.period;
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}h",
                    period.entity_id,
                    period.entity_type,
                    format_timestamp(&period.start),
                    period
                        .end
                        .as_ref()
                        .map(format_timestamp)
                        .unwrap_or_else(|| "open".to_string()),
                    period.last_event,
                    active.billable_hours()
                );
            }
        }
        Command::History { entity_id } => {
            let records = service
                .controller
                .history(&EntityId::new(entity_id))
                .await?;
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
    }

    Ok(())
}
