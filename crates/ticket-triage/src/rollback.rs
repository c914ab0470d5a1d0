//! Replay an audit CSV in reverse, restoring the pre-classification category.
//!
//! The audit file is trusted verbatim: rows are patched without re-reading
//! the ticket first, and a ticket edited after the audited update will be
//! overwritten. The work note names both the restored and the reverted-from
//! value so the overwrite stays visible in the ticket history.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::servicenow_bridge::{IncidentUpdate, TicketSource};

/// Counters for one rollback pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackStats {
    pub rows: usize,
    pub patched: usize,
    pub failed: usize,
}

/// One audit row as consumed by the rollback pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub ticket_number: String,
    pub ticket_id: String,
    pub old_category: String,
    pub new_category: String,
}

/// Split one CSV line of the audit files this crate writes: comma separated,
/// double-quote quoting, `""` escapes. Audit fields never span lines.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse an audit CSV into rows, resolving columns by header name.
pub fn read_audit_rows(path: &Path) -> Result<Vec<AuditRow>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit file {}", path.display()))?;
    let mut lines = content.lines();
    let columns = split_csv_line(lines.next().unwrap_or(""));
    let index = |name: &str| columns.iter().position(|c| c == name);

    let (Some(number_idx), Some(id_idx), Some(old_idx), Some(new_idx)) = (
        index("ticket_number"),
        index("ticket_id"),
        index("old_category"),
        index("new_category"),
    ) else {
        bail!("audit file {} is missing expected columns", path.display());
    };

    let mut rows = Vec::new();
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let fields = split_csv_line(line);
        let get = |idx: usize| fields.get(idx).cloned().unwrap_or_default();
        rows.push(AuditRow {
            ticket_number: get(number_idx),
            ticket_id: get(id_idx),
            old_category: get(old_idx),
            new_category: get(new_idx),
        });
    }
    Ok(rows)
}

/// The inverse of an audited classification update: restore the category and
/// clear the auto-classification markers.
fn inverse_update(row: &AuditRow) -> IncidentUpdate {
    IncidentUpdate {
        category: Some(row.old_category.clone()),
        subcategory: None,
        impact: None,
        urgency: None,
        assignment_group: None,
        work_notes: format!(
            "Rollback: restored category to '{}' (was: '{}')",
            row.old_category, row.new_category
        ),
        stamp: None,
    }
}

/// Process every audit row independently; a failed row is counted and
/// reported but never stops the rest. Without `commit`, only the intended
/// patch is logged and no network call is made.
pub async fn rollback_from_audit(
    source: &dyn TicketSource,
    audit_path: &Path,
    commit: bool,
) -> Result<RollbackStats> {
    let rows = read_audit_rows(audit_path)?;
    info!(rows = rows.len(), commit, "Loaded audit entries");

    let mut stats = RollbackStats {
        rows: rows.len(),
        ..Default::default()
    };

    for row in &rows {
        if !commit {
            info!(
                ticket = %row.ticket_number,
                sys_id = %row.ticket_id,
                category = %row.old_category,
                "[dry-run] would patch incident"
            );
            continue;
        }

        match source.apply_update(&row.ticket_id, &inverse_update(row)).await {
            Ok(true) => {
                stats.patched += 1;
                info!(ticket = %row.ticket_number, "Patched incident");
            }
            Ok(false) => {
                stats.failed += 1;
                error!(ticket = %row.ticket_number, "Failed to patch incident");
            }
            Err(e) => {
                stats.failed += 1;
                error!(ticket = %row.ticket_number, "Error patching incident: {e:#}");
            }
        }
    }

    Ok(stats)
}
