//! End-to-end: a live cycle writes an audit trail that rollback replays.

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::tempdir;

use ticket_triage::classifier::{parse_result, ChoiceVocabulary, ClassificationResult, Classify};
use ticket_triage::cycle::{run_cycle, CycleOptions};
use ticket_triage::errors::ClassifyError;
use ticket_triage::recorder::Recorder;
use ticket_triage::rollback::rollback_from_audit;
use ticket_triage::servicenow_bridge::{Incident, MemoryTicketSource};

/// Feeds a fixed model reply through the real extraction/validation path.
struct FixedClassifier {
    reply: Value,
}

#[async_trait]
impl Classify for FixedClassifier {
    async fn classify(
        &self,
        description: &str,
        vocab: &ChoiceVocabulary,
    ) -> Result<ClassificationResult, ClassifyError> {
        if description.trim().is_empty() {
            return Err(ClassifyError::EmptyInput);
        }
        parse_result(&self.reply, vocab)
    }
}

fn incident(n: u32, old_category: &str) -> Incident {
    Incident {
        sys_id: format!("sys-{n}"),
        number: format!("INC{n:07}"),
        short_description: format!("issue number {n}"),
        description: String::new(),
        state: "1".into(),
        priority: "3".into(),
        category: old_category.to_string(),
    }
}

fn source(incidents: Vec<Incident>) -> MemoryTicketSource {
    MemoryTicketSource::new()
        .with_incidents(incidents)
        .with_vocabulary(&["Network", "Software"], &["VPN"], &["1", "2"], &["1", "2"])
}

fn classifier() -> FixedClassifier {
    FixedClassifier {
        reply: json!({
            "category": "Network",
            "subcategory": "VPN",
            "impact": "2",
            "urgency": "1",
            "confidence": 0.9,
        }),
    }
}

fn audit_file_in(dir: &std::path::Path) -> std::path::PathBuf {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("audit_"))
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(files.len(), 1, "expected exactly one audit file");
    files.remove(0)
}

#[tokio::test]
async fn audit_round_trip_reverses_every_update() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(dir.path());
    let live = source(vec![
        incident(1, "inquiry"),
        incident(2, ""),
        incident(3, "hardware"),
    ]);
    let opts = CycleOptions {
        dry_run: false,
        ..CycleOptions::default()
    };

    let stats = run_cycle(&live, &classifier(), &recorder, &opts).await;
    assert_eq!(stats.updated, 3);
    assert_eq!(live.updates().len(), 3);

    let audit_path = audit_file_in(dir.path());
    let rows = std::fs::read_to_string(&audit_path).unwrap();
    assert_eq!(rows.lines().count(), 4, "header plus one row per update");

    // Replay against a fresh double standing in for the ticket system.
    let rollback_target = MemoryTicketSource::new();
    let rollback_stats = rollback_from_audit(&rollback_target, &audit_path, true)
        .await
        .unwrap();
    assert_eq!(rollback_stats.rows, 3);
    assert_eq!(rollback_stats.patched, 3);
    assert_eq!(rollback_stats.failed, 0);

    let reversals = rollback_target.updates();
    assert_eq!(reversals.len(), 3);
    let restored: Vec<(&str, Option<&str>)> = reversals
        .iter()
        .map(|u| (u.sys_id.as_str(), u.update.category.as_deref()))
        .collect();
    assert_eq!(
        restored,
        vec![
            ("sys-1", Some("inquiry")),
            ("sys-2", Some("")),
            ("sys-3", Some("hardware")),
        ]
    );
    for reversal in &reversals {
        assert!(reversal.update.stamp.is_none(), "markers must be cleared");
        assert!(reversal.update.work_notes.starts_with("Rollback:"));
    }
}

#[tokio::test]
async fn cycle_counters_are_monotonic_over_a_mixed_batch() {
    let dir = tempdir().unwrap();
    let recorder = Recorder::new(dir.path());
    let live = source(vec![
        incident(1, "a"),
        {
            let mut i = incident(2, "b");
            i.short_description = String::new(); // classification error
            i
        },
        incident(3, "c"),
    ])
    .failing_update("sys-3"); // update error
    let opts = CycleOptions {
        dry_run: false,
        ..CycleOptions::default()
    };

    let stats = run_cycle(&live, &classifier(), &recorder, &opts).await;

    assert!(stats.retrieved >= stats.classified);
    assert!(stats.classified >= stats.updated);
    assert_eq!(stats.retrieved, 3);
    assert_eq!(stats.classified, 2);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.errors, 2);

    // Audit holds only the confirmed update.
    let audit_path = audit_file_in(dir.path());
    let rows = std::fs::read_to_string(&audit_path).unwrap();
    assert_eq!(rows.lines().count(), 2);
    assert!(rows.contains("sys-1"));
}
