//! One fetch → classify → update pass over a bounded incident batch.
//!
//! Per-incident failures are contained: they bump the error counter and the
//! loop moves on. Only a missing vocabulary or a failed incident fetch aborts
//! the cycle, and even that only skips to the next scheduled run.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::classifier::{ChoiceVocabulary, ClassificationResult, Classify};
use crate::errors::CycleAbort;
use crate::recorder::{run_timestamp, AuditEntry, Recorder, ResultRecord};
use crate::servicenow_bridge::{ClassificationStamp, IncidentUpdate, TicketSource};

/// Knobs for one cycle.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    /// Maximum incidents fetched from the ticket source.
    pub limit: u32,
    /// Staged rollout: process only the first N of the fetched batch.
    pub sample_size: Option<usize>,
    /// Simulate updates instead of sending them.
    pub dry_run: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            sample_size: None,
            dry_run: true,
        }
    }
}

/// Counters for one cycle. Never persisted; reported in the summary line and
/// merged into [`ProcessStats`] by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub retrieved: usize,
    pub classified: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Cumulative counters for the life of the running process, owned by the
/// scheduling loop and merged after each cycle.
#[derive(Debug, Clone)]
pub struct ProcessStats {
    pub total_processed: usize,
    pub successfully_updated: usize,
    pub errors: usize,
    pub start_time: DateTime<Utc>,
}

impl ProcessStats {
    pub fn new() -> Self {
        Self {
            total_processed: 0,
            successfully_updated: 0,
            errors: 0,
            start_time: Utc::now(),
        }
    }

    pub fn merge(&mut self, cycle: &CycleStats) {
        self.total_processed += cycle.classified;
        self.successfully_updated += cycle.updated;
        self.errors += cycle.errors;
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }
}

impl Default for ProcessStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch all four choice lists once for the cycle and refuse to proceed when
/// a required one is empty.
async fn load_vocabulary(source: &dyn TicketSource) -> Result<ChoiceVocabulary, CycleAbort> {
    let categories = source.fetch_choice_values("category").await?;
    let subcategories = source.fetch_choice_values("subcategory").await?;
    let priority = source.fetch_priority_values().await?;
    let vocab = ChoiceVocabulary {
        categories,
        subcategories,
        impacts: priority.impact,
        urgencies: priority.urgency,
    };
    if let Some(field) = vocab.missing_required() {
        return Err(CycleAbort::MissingVocabulary(field));
    }
    Ok(vocab)
}

fn build_update(result: &ClassificationResult) -> IncidentUpdate {
    let work_notes = format!(
        "Auto-classified as {} ({:.1}%)\nProcessed by ticket-triage at {}",
        result.category,
        result.confidence * 100.0,
        Utc::now().to_rfc3339()
    );
    IncidentUpdate {
        category: Some(result.category.clone()),
        subcategory: result.subcategory.clone(),
        impact: Some(result.impact.clone()),
        urgency: Some(result.urgency.clone()),
        assignment_group: None,
        work_notes,
        stamp: Some(ClassificationStamp {
            category: result.category.clone(),
            confidence: result.confidence,
        }),
    }
}

fn log_summary(stats: &CycleStats) {
    info!(
        retrieved = stats.retrieved,
        classified = stats.classified,
        updated = stats.updated,
        errors = stats.errors,
        "Cycle summary"
    );
}

/// Run one complete cycle. Always returns stats; a cycle-level failure shows
/// up as an early return with whatever was counted so far.
pub async fn run_cycle(
    source: &dyn TicketSource,
    classifier: &dyn Classify,
    recorder: &Recorder,
    opts: &CycleOptions,
) -> CycleStats {
    let run_ts = run_timestamp();
    info!(dry_run = opts.dry_run, limit = opts.limit, "Starting ticket processing cycle");

    let mut stats = CycleStats::default();

    let mut incidents = match source.fetch_incidents(opts.limit).await {
        Ok(incidents) => incidents,
        Err(e) => {
            error!("Fatal error fetching incidents: {e:#}");
            log_summary(&stats);
            return stats;
        }
    };
    stats.retrieved = incidents.len();

    if incidents.is_empty() {
        info!("No new incidents to process");
        return stats;
    }

    if let Some(n) = opts.sample_size.filter(|n| *n > 0) {
        if n < incidents.len() {
            warn!(
                sample = n,
                fetched = incidents.len(),
                "Staged test: processing only the first incidents of the batch"
            );
        }
        incidents.truncate(n);
    }

    let vocab = match load_vocabulary(source).await {
        Ok(vocab) => vocab,
        Err(e) => {
            error!("Aborting cycle: {e}");
            log_summary(&stats);
            return stats;
        }
    };

    // Fixed up front so every audit entry of this cycle lands in one file.
    let audit_path = (!opts.dry_run).then(|| recorder.audit_path(&run_ts));

    let total = incidents.len();
    for (idx, incident) in incidents.iter().enumerate() {
        info!(
            ticket = %incident.number,
            "[{}/{}] Processing incident",
            idx + 1,
            total
        );

        let started = Instant::now();
        let result = match classifier
            .classify(&incident.short_description, &vocab)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(ticket = %incident.number, code = e.code(), "Classification failed: {e}");
                stats.errors += 1;
                continue;
            }
        };
        let exec_ms = started.elapsed().as_millis() as u64;
        stats.classified += 1;
        info!(
            ticket = %incident.number,
            category = %result.category,
            subcategory = result.subcategory.as_deref().unwrap_or(""),
            impact = %result.impact,
            urgency = %result.urgency,
            confidence = result.confidence,
            "Classified"
        );

        let record = ResultRecord::now(
            &incident.sys_id,
            &incident.short_description,
            &result.category,
            result.confidence,
            Vec::new(),
            exec_ms,
        );
        if let Err(e) = recorder.append_result(&record) {
            warn!("Failed to persist classification result: {e}");
        }

        let update = build_update(&result);
        match source.apply_update(&incident.sys_id, &update).await {
            Ok(true) => {
                stats.updated += 1;
                if let Some(audit_path) = &audit_path {
                    let entry = AuditEntry {
                        run_timestamp: run_ts.clone(),
                        ticket_number: incident.number.clone(),
                        ticket_id: incident.sys_id.clone(),
                        old_category: incident.category.clone(),
                        new_category: result.category.clone(),
                        confidence: result.confidence,
                        dry_run: opts.dry_run,
                    };
                    if let Err(e) = recorder.append_audit_entry(audit_path, &entry) {
                        warn!("Failed to write audit entry: {e}");
                    }
                }
            }
            Ok(false) => {
                error!(ticket = %incident.number, "Failed to update incident");
                stats.errors += 1;
            }
            Err(e) => {
                error!(ticket = %incident.number, "Error updating incident: {e:#}");
                stats.errors += 1;
            }
        }
    }

    log_summary(&stats);
    stats
}
