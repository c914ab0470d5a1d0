//! Runtime configuration for the triage service.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (e.g. `SNOW_INSTANCE_URL`)
//! 2. Values in `ticket-triage.toml`, when the file exists
//! 3. Built-in defaults

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default schedule interval between cycles, in seconds.
const DEFAULT_INTERVAL_SECS: u64 = 300;
/// Default directory for the result feed and audit files.
const DEFAULT_OUTPUTS_DIR: &str = "outputs";
/// Default health endpoint port.
const DEFAULT_HEALTH_PORT: u16 = 8000;
/// Default chat-completions endpoint (any OpenAI-compatible server).
const DEFAULT_LLM_URL: &str = "https://api.openai.com/v1/chat/completions";
/// Default model alias.
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

const ENV_SNOW_URL: &str = "SNOW_INSTANCE_URL";
const ENV_SNOW_USER: &str = "SNOW_USER";
const ENV_SNOW_PASSWORD: &str = "SNOW_PASSWORD";
const ENV_LLM_URL: &str = "LLM_API_URL";
const ENV_LLM_KEY: &str = "LLM_API_KEY";
const ENV_LLM_MODEL: &str = "LLM_MODEL";
const ENV_INTERVAL: &str = "SCHEDULE_INTERVAL";
const ENV_OUTPUTS_DIR: &str = "TRIAGE_OUTPUTS_DIR";
const ENV_DRY_RUN: &str = "DRY_RUN";
const ENV_PORT: &str = "PORT";

/// ServiceNow instance coordinates and credentials.
#[derive(Debug, Clone)]
pub struct ServiceNowConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Chat-completions endpoint used by the classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Full URL of the completions endpoint.
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub servicenow: ServiceNowConfig,
    pub classifier: ClassifierConfig,
    /// Seconds between scheduled cycles.
    pub interval_secs: u64,
    /// Directory receiving the result feed and audit CSVs.
    pub outputs_dir: PathBuf,
    /// Default execution mode; `--commit` on the CLI flips it per run.
    pub dry_run: bool,
    /// Port for the health endpoint.
    pub health_port: u16,
}

/// On-disk shape of `ticket-triage.toml`. Every field is optional; anything
/// absent falls through to the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub servicenow: FileServiceNow,
    #[serde(default)]
    pub classifier: FileClassifier,
    pub interval_secs: Option<u64>,
    pub outputs_dir: Option<String>,
    pub dry_run: Option<bool>,
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileServiceNow {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileClassifier {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config TOML")
    }
}

fn env_or(name: &str, fallback: String) -> String {
    env::var(name).unwrap_or(fallback)
}

impl TriageConfig {
    /// Resolve configuration from the default file location plus environment.
    pub fn load() -> Result<Self> {
        let path = Path::new("ticket-triage.toml");
        let file = if path.exists() {
            FileConfig::from_file(path)?
        } else {
            FileConfig::default()
        };
        Ok(Self::from_file_config(file))
    }

    /// Apply environment overrides on top of file values and defaults.
    pub fn from_file_config(file: FileConfig) -> Self {
        let interval_secs = env::var(ENV_INTERVAL)
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.interval_secs)
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        let health_port = env::var(ENV_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.health_port)
            .unwrap_or(DEFAULT_HEALTH_PORT);
        let dry_run = env::var(ENV_DRY_RUN)
            .ok()
            .map(|v| v.to_lowercase() == "true")
            .or(file.dry_run)
            .unwrap_or(true);

        Self {
            servicenow: ServiceNowConfig {
                base_url: env_or(
                    ENV_SNOW_URL,
                    file.servicenow
                        .base_url
                        .unwrap_or_else(|| "https://dev00000.service-now.com".to_string()),
                ),
                username: env_or(
                    ENV_SNOW_USER,
                    file.servicenow.username.unwrap_or_else(|| "admin".to_string()),
                ),
                password: env_or(
                    ENV_SNOW_PASSWORD,
                    file.servicenow.password.unwrap_or_default(),
                ),
            },
            classifier: ClassifierConfig {
                api_url: env_or(
                    ENV_LLM_URL,
                    file.classifier
                        .api_url
                        .unwrap_or_else(|| DEFAULT_LLM_URL.to_string()),
                ),
                api_key: env_or(ENV_LLM_KEY, file.classifier.api_key.unwrap_or_default()),
                model: env_or(
                    ENV_LLM_MODEL,
                    file.classifier
                        .model
                        .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                ),
            },
            interval_secs,
            outputs_dir: PathBuf::from(env_or(
                ENV_OUTPUTS_DIR,
                file.outputs_dir
                    .unwrap_or_else(|| DEFAULT_OUTPUTS_DIR.to_string()),
            )),
            dry_run,
            health_port,
        }
    }
}
