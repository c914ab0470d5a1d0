//! LLM incident classifier with a strict output contract.
//!
//! One chat-completion call per incident. The model is handed the four choice
//! lists verbatim and must answer with a single JSON object whose values come
//! from those lists; anything outside the vocabulary is rejected here, never
//! written back to the ticket system.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::errors::ClassifyError;

/// Completion call timeout. Model latency dominates, so this is much longer
/// than the ticket-system timeouts.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);
const TEMPERATURE: f32 = 0.1;
const MAX_TOKENS: u32 = 400;

const SYSTEM_PROMPT: &str = "You are an IT incident classifier. \
    Choose EXACT values from the provided lists. \
    Return ONLY a JSON object with keys: category, subcategory, impact, urgency, confidence. \
    confidence must be a number between 0 and 1.";

/// Per-cycle snapshot of the allowed values for each classification field.
///
/// Refetched every cycle; the ticket system owns these lists and may change
/// them between cycles.
#[derive(Debug, Clone, Default)]
pub struct ChoiceVocabulary {
    pub categories: Vec<String>,
    pub subcategories: Vec<String>,
    pub impacts: Vec<String>,
    pub urgencies: Vec<String>,
}

impl ChoiceVocabulary {
    /// Name of the first required list that is empty, if any. Subcategory is
    /// optional per ticket and may legitimately be empty.
    pub fn missing_required(&self) -> Option<&'static str> {
        if self.categories.is_empty() {
            return Some("category");
        }
        if self.impacts.is_empty() {
            return Some("impact");
        }
        if self.urgencies.is_empty() {
            return Some("urgency");
        }
        None
    }
}

/// A validated classification. Every non-null field is a member of the
/// vocabulary snapshot it was validated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub category: String,
    pub subcategory: Option<String>,
    pub impact: String,
    pub urgency: String,
    pub confidence: f64,
}

/// Seam between the cycle loop and the model call, so orchestration tests can
/// script classifier outcomes without a network.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(
        &self,
        description: &str,
        vocab: &ChoiceVocabulary,
    ) -> Result<ClassificationResult, ClassifyError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

/// Classifier backed by an OpenAI-compatible chat-completions endpoint.
pub struct LlmClassifier {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl LlmClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn complete(&self, user_payload: String) -> Result<String, ClassifyError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_payload,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .timeout(COMPLETION_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Inference(format!("HTTP {status}: {body}")));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Inference(format!("bad completion payload: {e}")))?;
        data.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClassifyError::Inference("completion returned no choices".into()))
    }
}

#[async_trait]
impl Classify for LlmClassifier {
    async fn classify(
        &self,
        description: &str,
        vocab: &ChoiceVocabulary,
    ) -> Result<ClassificationResult, ClassifyError> {
        if description.trim().is_empty() {
            return Err(ClassifyError::EmptyInput);
        }

        let user_payload = json!({
            "description": description,
            "category_choices": vocab.categories,
            "subcategory_choices": vocab.subcategories,
            "impact_choices": vocab.impacts,
            "urgency_choices": vocab.urgencies,
        })
        .to_string();

        let raw = self.complete(user_payload).await?;
        debug!(reply_len = raw.len(), "classifier reply received");
        let value = extract_json(&raw)?;
        parse_result(&value, vocab)
    }
}

/// Decode the model reply: direct JSON first, then the substring between the
/// first `{` and the last `}`.
pub fn extract_json(text: &str) -> Result<Value, ClassifyError> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            return serde_json::from_str(&text[start..=end])
                .map_err(|e| ClassifyError::MalformedOutput(e.to_string()));
        }
    }
    Err(ClassifyError::MalformedOutput(
        "no JSON object in reply".into(),
    ))
}

/// Map whatever the model put in `confidence` onto a number.
///
/// Numbers pass through, numeric strings parse, the words high/medium/low map
/// to 0.9/0.6/0.3, everything else is 0.0. This never rejects a result; it
/// only affects the numeric score.
pub fn normalize_confidence(raw: &Value) -> f64 {
    match raw {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<f64>() {
                return v;
            }
            match trimmed.to_lowercase().as_str() {
                "high" => 0.9,
                "medium" => 0.6,
                "low" => 0.3,
                _ => 0.0,
            }
        }
        _ => 0.0,
    }
}

fn require_member(
    field: &'static str,
    raw: Option<&Value>,
    allowed: &[String],
) -> Result<String, ClassifyError> {
    let invalid = |value: String| ClassifyError::InvalidEnumValue { field, value };
    match raw {
        Some(Value::String(s)) if allowed.iter().any(|a| a == s) => Ok(s.clone()),
        Some(Value::String(s)) => Err(invalid(s.clone())),
        Some(other) => Err(invalid(other.to_string())),
        None => Err(invalid("null".to_string())),
    }
}

/// Validate a decoded reply against the vocabulary snapshot.
///
/// This is the system's principal correctness guarantee: no value that is
/// missing from the snapshot ever reaches `apply_update`.
pub fn parse_result(
    value: &Value,
    vocab: &ChoiceVocabulary,
) -> Result<ClassificationResult, ClassifyError> {
    let category = require_member("category", value.get("category"), &vocab.categories)?;

    let subcategory = match value.get("subcategory") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => {
            if vocab.subcategories.iter().any(|a| a == s) {
                Some(s.clone())
            } else {
                return Err(ClassifyError::InvalidEnumValue {
                    field: "subcategory",
                    value: s.clone(),
                });
            }
        }
        Some(other) => {
            return Err(ClassifyError::InvalidEnumValue {
                field: "subcategory",
                value: other.to_string(),
            })
        }
    };

    let impact = require_member("impact", value.get("impact"), &vocab.impacts)?;
    let urgency = require_member("urgency", value.get("urgency"), &vocab.urgencies)?;
    let confidence =
        normalize_confidence(value.get("confidence").unwrap_or(&Value::Null)).clamp(0.0, 1.0);

    Ok(ClassificationResult {
        category,
        subcategory,
        impact,
        urgency,
        confidence,
    })
}
