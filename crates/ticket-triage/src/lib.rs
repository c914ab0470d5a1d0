//! LLM-backed incident triage for ServiceNow-style ticketing.
//!
//! The pipeline polls for new-or-unassigned incidents, classifies each short
//! description against the instance's own choice lists, patches the ticket,
//! and keeps an append-only audit trail that the rollback executor can replay
//! in reverse.

pub mod classifier;
pub mod config;
pub mod cycle;
pub mod errors;
pub mod health;
pub mod mapping;
pub mod recorder;
pub mod rollback;
pub mod servicenow_bridge;

pub use classifier::{ChoiceVocabulary, ClassificationResult, Classify, LlmClassifier};
pub use config::TriageConfig;
pub use cycle::{run_cycle, CycleOptions, CycleStats, ProcessStats};
pub use errors::{ClassifyError, CycleAbort, RecorderError};
pub use recorder::{AuditEntry, Recorder, ResultRecord};
pub use rollback::{rollback_from_audit, RollbackStats};
pub use servicenow_bridge::{
    Incident, IncidentUpdate, MemoryTicketSource, ServiceNowBridge, TicketSource,
};
