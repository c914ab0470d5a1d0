//! Validate the category-mapping file against live ServiceNow choices.
//!
//! The mapping file pairs internal category names with the value stored in
//! the ticket system. Choices drift as admins edit the instance; this pass
//! reports every mapped value that no longer exists and suggests the closest
//! live choice, optionally rewriting the file with those suggestions.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::info;

use crate::servicenow_bridge::TicketSource;

/// Minimum similarity for a suggestion, matching the usual close-match cutoff.
const SUGGESTION_CUTOFF: f64 = 0.6;

#[derive(Debug, Serialize)]
pub struct MappingReport {
    pub available_choices_count: usize,
    pub missing_mappings: Vec<MappingIssue>,
}

#[derive(Debug, Serialize)]
pub struct MappingIssue {
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_value: Option<String>,
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized, case-insensitive similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// The closest live choice above the cutoff, if any.
pub fn closest_choice(value: &str, choices: &[String]) -> Option<String> {
    choices
        .iter()
        .map(|c| (similarity(value, c), c))
        .filter(|(score, _)| *score >= SUGGESTION_CUTOFF)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, c)| c.clone())
}

fn load_mapping(path: &Path) -> Result<Mapping> {
    if !path.exists() {
        return Ok(Mapping::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mapping file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Mapping::new());
    }
    serde_yaml::from_str(&content).context("Failed to parse mapping YAML")
}

fn save_mapping(path: &Path, mapping: &Mapping) -> Result<()> {
    let yaml = serde_yaml::to_string(mapping).context("Failed to serialize mapping")?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write mapping file {}", path.display()))
}

/// Compare every mapping entry with the live choices.
fn build_report(mapping: &Mapping, choices: &[String]) -> MappingReport {
    let mut missing = Vec::new();
    for (key, value) in mapping {
        let Some(category) = key.as_str() else {
            continue;
        };
        let mapped = value.as_str().unwrap_or("");
        if mapped.is_empty() {
            missing.push(MappingIssue {
                category: category.to_string(),
                mapped_value: None,
                suggestion: None,
                issue: Some("empty".to_string()),
            });
            continue;
        }
        if choices.iter().any(|c| c == mapped) {
            continue;
        }
        missing.push(MappingIssue {
            category: category.to_string(),
            mapped_value: Some(mapped.to_string()),
            suggestion: closest_choice(mapped, choices),
            issue: None,
        });
    }
    MappingReport {
        available_choices_count: choices.len(),
        missing_mappings: missing,
    }
}

/// Validate the mapping file, write the report JSON, and with `apply`
/// rewrite the mapping using the suggestions.
pub async fn validate_mapping(
    source: &dyn TicketSource,
    mapping_path: &Path,
    report_path: &Path,
    apply: bool,
) -> Result<MappingReport> {
    let choices = source.fetch_choice_values("category").await?;
    if choices.is_empty() {
        bail!("no category choices available from the ticket system; cannot validate mapping");
    }

    let mut mapping = load_mapping(mapping_path)?;
    let report = build_report(&mapping, &choices);

    if let Some(parent) = report_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(report_path, serde_json::to_vec_pretty(&report)?)
        .with_context(|| format!("Failed to write report {}", report_path.display()))?;
    info!(
        missing = report.missing_mappings.len(),
        report = %report_path.display(),
        "Wrote mapping validation report"
    );

    if apply {
        let mut changed = false;
        for issue in &report.missing_mappings {
            if let Some(suggestion) = &issue.suggestion {
                mapping.insert(
                    YamlValue::String(issue.category.clone()),
                    YamlValue::String(suggestion.clone()),
                );
                changed = true;
            }
        }
        if changed {
            save_mapping(mapping_path, &mapping)?;
            info!(path = %mapping_path.display(), "Applied suggested fixes to mapping file");
        } else {
            info!("No automatic suggestions available to apply");
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servicenow_bridge::MemoryTicketSource;
    use tempfile::tempdir;

    #[test]
    fn similarity_basics() {
        assert_eq!(similarity("Network", "Network"), 1.0);
        assert_eq!(similarity("network", "NETWORK"), 1.0);
        assert!(similarity("Netwrok", "Network") > 0.7);
        assert!(similarity("Telephony", "Database") < 0.5);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn closest_choice_respects_cutoff() {
        let choices = vec!["Network".to_string(), "Database".to_string()];
        assert_eq!(closest_choice("Netwrk", &choices).as_deref(), Some("Network"));
        assert_eq!(closest_choice("zzzzzz", &choices), None);
    }

    #[test]
    fn build_report_flags_empty_and_unknown_values() {
        let mapping: Mapping = serde_yaml::from_str(
            "connectivity: Netwrok\nstorage: Database\nunset: \"\"\n",
        )
        .unwrap();
        let choices = vec!["Network".to_string(), "Database".to_string()];

        let report = build_report(&mapping, &choices);
        assert_eq!(report.available_choices_count, 2);
        assert_eq!(report.missing_mappings.len(), 2);

        let bad = &report.missing_mappings[0];
        assert_eq!(bad.category, "connectivity");
        assert_eq!(bad.suggestion.as_deref(), Some("Network"));

        let empty = &report.missing_mappings[1];
        assert_eq!(empty.category, "unset");
        assert_eq!(empty.issue.as_deref(), Some("empty"));
    }

    #[tokio::test]
    async fn apply_rewrites_mapping_with_suggestions() {
        let dir = tempdir().unwrap();
        let mapping_path = dir.path().join("category_mapping.yaml");
        let report_path = dir.path().join("report.json");
        std::fs::write(&mapping_path, "connectivity: Netwrok\n").unwrap();

        let source = MemoryTicketSource::new().with_vocabulary(
            &["Network", "Database"],
            &[],
            &["1"],
            &["1"],
        );

        let report = validate_mapping(&source, &mapping_path, &report_path, true)
            .await
            .unwrap();
        assert_eq!(report.missing_mappings.len(), 1);
        assert!(report_path.exists());

        let rewritten = std::fs::read_to_string(&mapping_path).unwrap();
        assert!(rewritten.contains("connectivity: Network"));
    }

    #[tokio::test]
    async fn missing_choices_abort_validation() {
        let dir = tempdir().unwrap();
        let source = MemoryTicketSource::new();
        let result = validate_mapping(
            &source,
            &dir.path().join("m.yaml"),
            &dir.path().join("r.json"),
            false,
        )
        .await;
        assert!(result.is_err());
    }
}
