use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ticket_triage::classifier::LlmClassifier;
use ticket_triage::config::TriageConfig;
use ticket_triage::cycle::{run_cycle, CycleOptions, ProcessStats};
use ticket_triage::recorder::Recorder;
use ticket_triage::rollback::rollback_from_audit;
use ticket_triage::servicenow_bridge::{ServiceNowBridge, TicketSource};
use ticket_triage::{health, mapping};

#[derive(Parser)]
#[command(name = "ticket-triage", version, about = "Classify incoming incidents with an LLM and write the labels back")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single classification cycle (dry-run unless --commit).
    Run {
        /// Apply updates to the ticket system instead of simulating them.
        #[arg(long)]
        commit: bool,
        /// Maximum incidents to retrieve.
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Process only the first N incidents of the batch (staged test).
        #[arg(long)]
        sample_size: Option<usize>,
    },
    /// Start the scheduled loop together with the health endpoint.
    Schedule {
        /// Seconds between cycles; defaults to the configured interval.
        #[arg(long)]
        interval: Option<u64>,
        /// Apply updates instead of simulating them.
        #[arg(long)]
        commit: bool,
        /// Maximum incidents to retrieve per cycle.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Reverse the updates recorded in an audit CSV (dry-run unless --commit).
    Rollback {
        /// Path to the audit CSV produced by a live cycle.
        #[arg(long)]
        audit: PathBuf,
        /// Actually patch the ticket system.
        #[arg(long)]
        commit: bool,
    },
    /// Check the category-mapping file against the live choice list.
    ValidateMapping {
        #[arg(long, default_value = "category_mapping.yaml")]
        mapping: PathBuf,
        #[arg(long, default_value = "outputs/mapping_suggestions.json")]
        report: PathBuf,
        /// Rewrite the mapping file with the closest-match suggestions.
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = TriageConfig::load()?;

    match cli.command {
        Command::Run {
            commit,
            limit,
            sample_size,
        } => {
            let dry_run = !commit;
            let bridge = ServiceNowBridge::new(config.servicenow.clone(), dry_run);
            if !bridge.check_connection().await {
                warn!("Ticket system connectivity check failed - continuing anyway");
            }
            let classifier = LlmClassifier::new(config.classifier.clone());
            let recorder = Recorder::new(&config.outputs_dir);
            let opts = CycleOptions {
                limit,
                sample_size,
                dry_run,
            };
            let stats = run_cycle(&bridge, &classifier, &recorder, &opts).await;
            info!(?stats, "Run complete");
        }
        Command::Schedule {
            interval,
            commit,
            limit,
        } => {
            schedule_loop(config, interval, commit, limit).await?;
        }
        Command::Rollback { audit, commit } => {
            let bridge = ServiceNowBridge::new(config.servicenow.clone(), !commit);
            let stats = rollback_from_audit(&bridge, &audit, commit).await?;
            info!(
                rows = stats.rows,
                patched = stats.patched,
                failed = stats.failed,
                "Rollback complete"
            );
        }
        Command::ValidateMapping {
            mapping: mapping_path,
            report,
            apply,
        } => {
            let bridge = ServiceNowBridge::new(config.servicenow.clone(), true);
            let result = mapping::validate_mapping(&bridge, &mapping_path, &report, apply).await?;
            info!(
                choices = result.available_choices_count,
                missing = result.missing_mappings.len(),
                "Mapping validation complete"
            );
        }
    }

    Ok(())
}

/// Health endpoint plus an immediate first cycle, then one cycle per
/// interval. Ctrl-C lets the in-flight cycle finish, then prints the
/// cumulative statistics and exits.
async fn schedule_loop(
    config: TriageConfig,
    interval: Option<u64>,
    commit: bool,
    limit: u32,
) -> Result<()> {
    let interval_secs = interval.unwrap_or(config.interval_secs);
    let dry_run = if commit { false } else { config.dry_run };

    info!(interval_secs, dry_run, "Scheduler starting");

    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port).await {
            warn!("Health endpoint failed: {e:#}");
        }
    });

    let bridge = ServiceNowBridge::new(config.servicenow.clone(), dry_run);
    if !bridge.check_connection().await {
        warn!("Ticket system connection failed - will retry on schedule");
    }
    let classifier = LlmClassifier::new(config.classifier.clone());
    let recorder = Recorder::new(&config.outputs_dir);
    let opts = CycleOptions {
        limit,
        sample_size: None,
        dry_run,
    };

    let mut process = ProcessStats::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Stop signal received");
                break;
            }
            _ = ticker.tick() => {
                let stats = run_cycle(&bridge, &classifier, &recorder, &opts).await;
                process.merge(&stats);
            }
        }
    }

    info!(
        uptime_secs = process.uptime().num_seconds(),
        total_processed = process.total_processed,
        successfully_updated = process.successfully_updated,
        errors = process.errors,
        "Final statistics"
    );
    Ok(())
}
