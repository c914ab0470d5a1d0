//! Bridge to the ServiceNow REST API.
//!
//! `TicketSource` is the seam between the cycle loop and the ticket system:
//! one live adapter (`ServiceNowBridge`) and one in-memory double
//! (`MemoryTicketSource`) that records every update for assertions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::ServiceNowConfig;

/// Connectivity probe timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for table reads and the update PATCH.
const TABLE_TIMEOUT: Duration = Duration::from_secs(10);
/// ServiceNow stores `incident.category` in a 40-character column.
const CATEGORY_MAX_LEN: usize = 40;
/// Server-side filter: new or unassigned incidents.
const NEW_INCIDENT_QUERY: &str = "state=1^ORstate=2^assignment_groupISEMPTY";
const INCIDENT_FIELDS: &str = "sys_id,number,short_description,description,state,priority,category";

/// One incident row, as consumed by the cycle loop. ServiceNow returns every
/// field as a string.
#[derive(Debug, Clone, Deserialize)]
pub struct Incident {
    pub sys_id: String,
    pub number: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub category: String,
}

/// Distinct values from the priority lookup table.
#[derive(Debug, Clone, Default)]
pub struct PriorityValues {
    pub impact: Vec<String>,
    pub urgency: Vec<String>,
    pub priority: Vec<String>,
}

/// Auto-classification bookkeeping fields on the incident.
///
/// `Some` stamps them (normal classification update); rollback passes the
/// update with no stamp, which clears them.
#[derive(Debug, Clone)]
pub struct ClassificationStamp {
    pub category: String,
    pub confidence: f64,
}

/// Field set for one incident PATCH.
#[derive(Debug, Clone)]
pub struct IncidentUpdate {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub impact: Option<String>,
    pub urgency: Option<String>,
    pub assignment_group: Option<String>,
    pub work_notes: String,
    pub stamp: Option<ClassificationStamp>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Cheap connectivity probe. A failure is a startup warning, never fatal.
    async fn check_connection(&self) -> bool;

    /// Fetch up to `limit` new-or-unassigned incidents.
    async fn fetch_incidents(&self, limit: u32) -> Result<Vec<Incident>>;

    /// Ordered-unique choice values for one incident field.
    async fn fetch_choice_values(&self, element: &str) -> Result<Vec<String>>;

    /// Distinct impact/urgency/priority values from the lookup table.
    async fn fetch_priority_values(&self) -> Result<PriorityValues>;

    /// PATCH one incident. `Ok(false)` means the ticket system rejected the
    /// update; the caller counts it as an error with no state change.
    async fn apply_update(&self, sys_id: &str, update: &IncidentUpdate) -> Result<bool>;

    /// Resolve an assignment group name to its sys_id.
    async fn lookup_group_id(&self, name: &str) -> Result<Option<String>>;
}

/// Live adapter over the ServiceNow table API with basic auth.
pub struct ServiceNowBridge {
    client: reqwest::Client,
    config: ServiceNowConfig,
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    #[serde(default)]
    result: Vec<Value>,
}

impl ServiceNowBridge {
    pub fn new(config: ServiceNowConfig, dry_run: bool) -> Self {
        info!(url = %config.base_url, dry_run, "ServiceNow bridge initialized");
        Self {
            client: reqwest::Client::new(),
            config,
            dry_run,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/api/now/table/{}", self.config.base_url, table)
    }

    async fn get_rows(
        &self,
        table: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(self.table_url(table))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("GET {table} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("GET {table} returned HTTP {status}");
        }

        let data: TableResponse = response
            .json()
            .await
            .with_context(|| format!("GET {table} returned an unexpected payload"))?;
        Ok(data.result)
    }
}

/// Prefer the stored `value`, fall back to `label`, dedup preserving order.
fn choice_values_from_rows(rows: &[Value]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        let value = row
            .get("value")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| row.get("label").and_then(Value::as_str).filter(|s| !s.is_empty()));
        if let Some(v) = value {
            if seen.insert(v.to_string()) {
                out.push(v.to_string());
            }
        }
    }
    out
}

fn distinct_column(rows: &[Value], column: &str) -> Vec<String> {
    let set: BTreeSet<String> = rows
        .iter()
        .filter_map(|r| r.get(column).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    set.into_iter().collect()
}

/// Build the PATCH body for one update. Category is truncated to the column
/// width; the stamp decides whether the auto-classification markers are set
/// or cleared.
fn update_body(update: &IncidentUpdate) -> Value {
    let mut body = serde_json::Map::new();

    match &update.stamp {
        Some(stamp) => {
            body.insert(
                "u_auto_classification_category".into(),
                json!(stamp.category),
            );
            body.insert(
                "u_confidence_score".into(),
                json!(format!("{:.2}", stamp.confidence * 100.0)),
            );
            body.insert("u_auto_classified".into(), json!("true"));
            body.insert(
                "u_classification_timestamp".into(),
                json!(Utc::now().to_rfc3339()),
            );
        }
        None => {
            body.insert("u_auto_classified".into(), json!("false"));
            body.insert("u_auto_classification_category".into(), json!(""));
        }
    }

    if let Some(category) = &update.category {
        let truncated: String = category.chars().take(CATEGORY_MAX_LEN).collect();
        body.insert("category".into(), json!(truncated));
    }
    if let Some(subcategory) = &update.subcategory {
        body.insert("subcategory".into(), json!(subcategory));
    }
    if let Some(impact) = &update.impact {
        body.insert("impact".into(), json!(impact));
    }
    if let Some(urgency) = &update.urgency {
        body.insert("urgency".into(), json!(urgency));
    }
    if let Some(group) = &update.assignment_group {
        body.insert("assignment_group".into(), json!(group));
    }
    body.insert("work_notes".into(), json!(update.work_notes));

    Value::Object(body)
}

#[async_trait]
impl TicketSource for ServiceNowBridge {
    async fn check_connection(&self) -> bool {
        let query = [("sysparm_limit", "1".to_string())];
        match self.get_rows("incident", &query, CONNECT_TIMEOUT).await {
            Ok(_) => {
                info!("ServiceNow connection verified");
                true
            }
            Err(e) => {
                error!("ServiceNow connection failed: {e:#}");
                false
            }
        }
    }

    async fn fetch_incidents(&self, limit: u32) -> Result<Vec<Incident>> {
        let query = [
            ("sysparm_query", NEW_INCIDENT_QUERY.to_string()),
            ("sysparm_limit", limit.to_string()),
            ("sysparm_fields", INCIDENT_FIELDS.to_string()),
            ("sysparm_exclude_reference_link", "true".to_string()),
        ];
        let rows = self.get_rows("incident", &query, TABLE_TIMEOUT).await?;
        let incidents = rows
            .into_iter()
            .map(|row| serde_json::from_value(row).context("malformed incident row"))
            .collect::<Result<Vec<Incident>>>()?;
        info!(count = incidents.len(), "Retrieved incidents");
        Ok(incidents)
    }

    async fn fetch_choice_values(&self, element: &str) -> Result<Vec<String>> {
        let query = [
            ("sysparm_query", format!("name=incident^element={element}")),
            ("sysparm_fields", "value,label".to_string()),
            ("sysparm_limit", "1000".to_string()),
        ];
        let rows = self.get_rows("sys_choice", &query, TABLE_TIMEOUT).await?;
        Ok(choice_values_from_rows(&rows))
    }

    async fn fetch_priority_values(&self) -> Result<PriorityValues> {
        let query = [
            ("sysparm_fields", "impact,urgency,priority".to_string()),
            ("sysparm_limit", "1000".to_string()),
            ("sysparm_exclude_reference_link", "true".to_string()),
        ];
        let rows = self.get_rows("dl_u_priority", &query, TABLE_TIMEOUT).await?;
        Ok(PriorityValues {
            impact: distinct_column(&rows, "impact"),
            urgency: distinct_column(&rows, "urgency"),
            priority: distinct_column(&rows, "priority"),
        })
    }

    async fn apply_update(&self, sys_id: &str, update: &IncidentUpdate) -> Result<bool> {
        if self.dry_run {
            info!(
                sys_id,
                category = update.category.as_deref().unwrap_or(""),
                "[dry-run] would update incident"
            );
            return Ok(true);
        }

        let url = format!("{}/{}", self.table_url("incident"), sys_id);
        let response = self
            .client
            .patch(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&update_body(update))
            .timeout(TABLE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("PATCH incident {sys_id} failed"))?;

        let status = response.status();
        if status.is_success() {
            info!(
                sys_id,
                category = update.category.as_deref().unwrap_or(""),
                "Updated incident"
            );
            Ok(true)
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(sys_id, %status, body = %body, "Incident update rejected");
            Ok(false)
        }
    }

    async fn lookup_group_id(&self, name: &str) -> Result<Option<String>> {
        let query = [
            ("sysparm_query", format!("name={name}")),
            ("sysparm_fields", "sys_id,name".to_string()),
        ];
        let rows = self.get_rows("sys_user_group", &query, TABLE_TIMEOUT).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("sys_id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// One recorded `apply_update` call on the in-memory double.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub sys_id: String,
    pub update: IncidentUpdate,
}

/// In-memory ticket source for tests: seeded incidents and vocabularies,
/// every update recorded. Updates always succeed unless the sys_id is listed
/// in `failing`.
#[derive(Default)]
pub struct MemoryTicketSource {
    incidents: Vec<Incident>,
    categories: Vec<String>,
    subcategories: Vec<String>,
    impacts: Vec<String>,
    urgencies: Vec<String>,
    groups: HashMap<String, String>,
    failing: Vec<String>,
    updates: Mutex<Vec<RecordedUpdate>>,
}

impl MemoryTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_incidents(mut self, incidents: Vec<Incident>) -> Self {
        self.incidents = incidents;
        self
    }

    pub fn with_vocabulary(
        mut self,
        categories: &[&str],
        subcategories: &[&str],
        impacts: &[&str],
        urgencies: &[&str],
    ) -> Self {
        self.categories = categories.iter().map(|s| s.to_string()).collect();
        self.subcategories = subcategories.iter().map(|s| s.to_string()).collect();
        self.impacts = impacts.iter().map(|s| s.to_string()).collect();
        self.urgencies = urgencies.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_group(mut self, name: &str, sys_id: &str) -> Self {
        self.groups.insert(name.to_string(), sys_id.to_string());
        self
    }

    /// Make `apply_update` report failure for the given sys_id.
    pub fn failing_update(mut self, sys_id: &str) -> Self {
        self.failing.push(sys_id.to_string());
        self
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().expect("updates lock").clone()
    }
}

#[async_trait]
impl TicketSource for MemoryTicketSource {
    async fn check_connection(&self) -> bool {
        true
    }

    async fn fetch_incidents(&self, limit: u32) -> Result<Vec<Incident>> {
        Ok(self.incidents.iter().take(limit as usize).cloned().collect())
    }

    async fn fetch_choice_values(&self, element: &str) -> Result<Vec<String>> {
        Ok(match element {
            "category" => self.categories.clone(),
            "subcategory" => self.subcategories.clone(),
            _ => Vec::new(),
        })
    }

    async fn fetch_priority_values(&self) -> Result<PriorityValues> {
        Ok(PriorityValues {
            impact: self.impacts.clone(),
            urgency: self.urgencies.clone(),
            priority: Vec::new(),
        })
    }

    async fn apply_update(&self, sys_id: &str, update: &IncidentUpdate) -> Result<bool> {
        if self.failing.iter().any(|f| f == sys_id) {
            return Ok(false);
        }
        self.updates.lock().expect("updates lock").push(RecordedUpdate {
            sys_id: sys_id.to_string(),
            update: update.clone(),
        });
        Ok(true)
    }

    async fn lookup_group_id(&self, name: &str) -> Result<Option<String>> {
        Ok(self.groups.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_values_prefer_value_and_dedup_in_order() {
        let rows = vec![
            json!({"value": "Network", "label": "Network issues"}),
            json!({"value": "", "label": "Software"}),
            json!({"value": "Network", "label": "Network again"}),
            json!({"value": "Database"}),
            json!({"label": ""}),
        ];
        assert_eq!(
            choice_values_from_rows(&rows),
            vec!["Network", "Software", "Database"]
        );
    }

    #[test]
    fn distinct_column_sorts_and_dedups() {
        let rows = vec![
            json!({"impact": "2"}),
            json!({"impact": "1"}),
            json!({"impact": "2"}),
            json!({"impact": ""}),
        ];
        assert_eq!(distinct_column(&rows, "impact"), vec!["1", "2"]);
    }

    #[test]
    fn update_body_truncates_category_and_stamps_markers() {
        let long_category = "X".repeat(60);
        let update = IncidentUpdate {
            category: Some(long_category),
            subcategory: Some("VPN".into()),
            impact: Some("2".into()),
            urgency: Some("1".into()),
            assignment_group: None,
            work_notes: "classified".into(),
            stamp: Some(ClassificationStamp {
                category: "Network".into(),
                confidence: 0.876,
            }),
        };
        let body = update_body(&update);
        assert_eq!(body["category"].as_str().unwrap().len(), CATEGORY_MAX_LEN);
        assert_eq!(body["u_auto_classified"], "true");
        assert_eq!(body["u_confidence_score"], "87.60");
        assert_eq!(body["u_auto_classification_category"], "Network");
        assert!(body.get("u_classification_timestamp").is_some());
        assert!(body.get("assignment_group").is_none());
    }

    #[test]
    fn update_body_without_stamp_clears_markers() {
        let update = IncidentUpdate {
            category: Some("Network".into()),
            subcategory: None,
            impact: None,
            urgency: None,
            assignment_group: None,
            work_notes: "rollback".into(),
            stamp: None,
        };
        let body = update_body(&update);
        assert_eq!(body["u_auto_classified"], "false");
        assert_eq!(body["u_auto_classification_category"], "");
        assert!(body.get("u_confidence_score").is_none());
        assert!(body.get("u_classification_timestamp").is_none());
    }

    #[tokio::test]
    async fn memory_source_records_updates_and_honors_failures() {
        let source = MemoryTicketSource::new().failing_update("bad-id");
        let update = IncidentUpdate {
            category: Some("Network".into()),
            subcategory: None,
            impact: None,
            urgency: None,
            assignment_group: None,
            work_notes: "note".into(),
            stamp: None,
        };

        assert!(source.apply_update("good-id", &update).await.unwrap());
        assert!(!source.apply_update("bad-id", &update).await.unwrap());

        let recorded = source.updates();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].sys_id, "good-id");
    }

    #[tokio::test]
    async fn memory_source_resolves_known_groups_only() {
        let source = MemoryTicketSource::new().with_group("Service Desk", "grp-123");
        assert_eq!(
            source.lookup_group_id("Service Desk").await.unwrap(),
            Some("grp-123".to_string())
        );
        assert_eq!(source.lookup_group_id("Nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_source_respects_fetch_limit() {
        let incident = |n: &str| Incident {
            sys_id: format!("id-{n}"),
            number: format!("INC000{n}"),
            short_description: "printer on fire".into(),
            description: String::new(),
            state: "1".into(),
            priority: "3".into(),
            category: String::new(),
        };
        let source = MemoryTicketSource::new()
            .with_incidents(vec![incident("1"), incident("2"), incident("3")]);
        let fetched = source.fetch_incidents(2).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[1].number, "INC0002");
    }
}
