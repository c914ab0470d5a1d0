//! Persistence for classification results and the per-run audit trail.
//!
//! Two independent sinks:
//! - the result feed (`task_results.json` + latest mirror + timestamped
//!   archive + CSV mirror), written on every successful classification,
//!   dry-run or not;
//! - the audit CSV (`audit_<run_ts>.csv`), one row per confirmed live update,
//!   append-only, consumed later by the rollback executor.
//!
//! Feed writes go through a temp file and an atomic rename; the previous
//! snapshot is archived first, so an interrupted write can lose at most the
//! newest record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::RecorderError;

const RESULTS_JSON: &str = "task_results.json";
const RESULTS_LATEST: &str = "task_results_latest.json";
const RESULTS_CSV: &str = "task_results.csv";
const ARCHIVE_DIR: &str = "archive";

const RESULTS_CSV_HEADER: &str =
    "timestamp,ticket_id,input_text,category,confidence,matched_keywords,execution_time_ms";
const AUDIT_CSV_HEADER: &str =
    "run_timestamp,ticket_number,ticket_id,old_category,new_category,confidence,dry_run";

/// One classification outcome in the result feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub timestamp: String,
    pub ticket_id: String,
    pub input_text: String,
    pub category: String,
    pub confidence: f64,
    pub matched_keywords: Vec<String>,
    pub execution_time_ms: u64,
}

impl ResultRecord {
    pub fn now(
        ticket_id: &str,
        input_text: &str,
        category: &str,
        confidence: f64,
        matched_keywords: Vec<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            ticket_id: ticket_id.to_string(),
            input_text: input_text.to_string(),
            category: category.to_string(),
            confidence,
            matched_keywords,
            execution_time_ms,
        }
    }
}

/// One applied change, sufficient to reverse it later.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub run_timestamp: String,
    pub ticket_number: String,
    pub ticket_id: String,
    pub old_category: String,
    pub new_category: String,
    pub confidence: f64,
    pub dry_run: bool,
}

/// Compact UTC stamp used in audit and archive file names.
pub fn run_timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Quote a CSV field when it contains a delimiter, quote or newline.
pub fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecorderError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, bytes).map_err(|e| RecorderError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| RecorderError::io(path, e))
}

fn append_csv_line(path: &Path, header: &str, line: &str) -> Result<(), RecorderError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RecorderError::io(parent, e))?;
    }
    let write_header = !path.exists();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| RecorderError::io(path, e))?;
    if write_header {
        writeln!(file, "{header}").map_err(|e| RecorderError::io(path, e))?;
    }
    writeln!(file, "{line}").map_err(|e| RecorderError::io(path, e))
}

/// File-backed recorder rooted at the outputs directory.
pub struct Recorder {
    outputs_dir: PathBuf,
}

impl Recorder {
    pub fn new(outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
        }
    }

    /// Audit file for the run that started at `run_ts`. All entries of one
    /// cycle share this file.
    pub fn audit_path(&self, run_ts: &str) -> PathBuf {
        self.outputs_dir.join(format!("audit_{run_ts}.csv"))
    }

    /// Append one record to the result feed and its mirrors.
    pub fn append_result(&self, record: &ResultRecord) -> Result<(), RecorderError> {
        fs::create_dir_all(&self.outputs_dir)
            .map_err(|e| RecorderError::io(&self.outputs_dir, e))?;
        let feed_path = self.outputs_dir.join(RESULTS_JSON);

        // A corrupted or missing feed starts over rather than blocking the
        // pipeline; the archive keeps whatever was readable before.
        let mut records: Vec<ResultRecord> = match fs::read_to_string(&feed_path) {
            Ok(content) if !content.trim().is_empty() => {
                serde_json::from_str(&content).unwrap_or_default()
            }
            _ => Vec::new(),
        };

        if feed_path.exists() {
            self.archive_snapshot(&feed_path);
        }

        records.push(record.clone());
        let json = serde_json::to_vec_pretty(&records)?;
        write_atomic(&feed_path, &json)?;

        // Latest mirror is best-effort; the primary feed already landed.
        let latest = self.outputs_dir.join(RESULTS_LATEST);
        if let Err(e) = write_atomic(&latest, &json) {
            warn!("Failed to refresh latest snapshot: {e}");
        }

        let line = [
            csv_field(&record.timestamp),
            csv_field(&record.ticket_id),
            csv_field(&record.input_text),
            csv_field(&record.category),
            format!("{}", record.confidence),
            csv_field(&record.matched_keywords.join(";")),
            format!("{}", record.execution_time_ms),
        ]
        .join(",");
        append_csv_line(&self.outputs_dir.join(RESULTS_CSV), RESULTS_CSV_HEADER, &line)
    }

    fn archive_snapshot(&self, feed_path: &Path) {
        let archive_dir = self.outputs_dir.join(ARCHIVE_DIR);
        if let Err(e) = fs::create_dir_all(&archive_dir) {
            warn!("Failed to create archive directory: {e}");
            return;
        }
        let archive_path = archive_dir.join(format!("task_results_{}.json", run_timestamp()));
        if let Err(e) = fs::copy(feed_path, &archive_path) {
            warn!("Failed to archive result snapshot: {e}");
        }
    }

    /// Append one row to the run's audit file.
    pub fn append_audit_entry(
        &self,
        audit_path: &Path,
        entry: &AuditEntry,
    ) -> Result<(), RecorderError> {
        let line = [
            csv_field(&entry.run_timestamp),
            csv_field(&entry.ticket_number),
            csv_field(&entry.ticket_id),
            csv_field(&entry.old_category),
            csv_field(&entry.new_category),
            format!("{:.3}", entry.confidence),
            entry.dry_run.to_string(),
        ]
        .join(",");
        append_csv_line(audit_path, AUDIT_CSV_HEADER, &line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(n: u32) -> ResultRecord {
        ResultRecord::now(
            &format!("id-{n}"),
            "vpn drops every hour",
            "Network",
            0.85,
            vec![],
            120,
        )
    }

    #[test]
    fn csv_field_quotes_only_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn result_feed_grows_and_mirrors() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(dir.path());

        recorder.append_result(&record(1)).unwrap();
        recorder.append_result(&record(2)).unwrap();

        let feed: Vec<ResultRecord> =
            serde_json::from_str(&fs::read_to_string(dir.path().join(RESULTS_JSON)).unwrap())
                .unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[1].ticket_id, "id-2");

        let latest: Vec<ResultRecord> =
            serde_json::from_str(&fs::read_to_string(dir.path().join(RESULTS_LATEST)).unwrap())
                .unwrap();
        assert_eq!(latest.len(), 2);

        let csv = fs::read_to_string(dir.path().join(RESULTS_CSV)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RESULTS_CSV_HEADER);
        assert!(lines[2].starts_with(&format!("{},id-2", feed[1].timestamp)));
    }

    #[test]
    fn second_append_archives_previous_snapshot() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(dir.path());

        recorder.append_result(&record(1)).unwrap();
        recorder.append_result(&record(2)).unwrap();

        let archive_entries: Vec<_> = fs::read_dir(dir.path().join(ARCHIVE_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(!archive_entries.is_empty());

        // The archived copy is the one-record snapshot from before append #2.
        let archived: Vec<ResultRecord> =
            serde_json::from_str(&fs::read_to_string(archive_entries[0].path()).unwrap()).unwrap();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn corrupt_feed_starts_over() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(dir.path());
        fs::write(dir.path().join(RESULTS_JSON), "{not json").unwrap();

        recorder.append_result(&record(1)).unwrap();

        let feed: Vec<ResultRecord> =
            serde_json::from_str(&fs::read_to_string(dir.path().join(RESULTS_JSON)).unwrap())
                .unwrap();
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn audit_rows_append_under_one_header() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(dir.path());
        let audit_path = recorder.audit_path("20260201T120000Z");

        for n in 1..=2 {
            recorder
                .append_audit_entry(
                    &audit_path,
                    &AuditEntry {
                        run_timestamp: "20260201T120000Z".into(),
                        ticket_number: format!("INC000{n}"),
                        ticket_id: format!("id-{n}"),
                        old_category: "".into(),
                        new_category: "Network".into(),
                        confidence: 0.9,
                        dry_run: false,
                    },
                )
                .unwrap();
        }

        let csv = fs::read_to_string(&audit_path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], AUDIT_CSV_HEADER);
        assert!(lines[1].contains("INC0001"));
        assert!(lines[1].ends_with("0.900,false"));
    }
}
