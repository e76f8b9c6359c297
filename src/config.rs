use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{JanitorError, Result};
use crate::models::{EmailCategory, CONFIDENCE_MAX, CONFIDENCE_MIN};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Seconds to wait between runs in polling mode
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            state_file: default_state_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// OpenAI-compatible endpoint; the default is a local Ollama server
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable holding the API key, if the endpoint needs one
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Results below this confidence are flagged for review in the run report
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_body_char_limit")]
    pub body_char_limit: usize,
    #[serde(default = "default_snippet_char_limit")]
    pub snippet_char_limit: usize,
    /// Hard ceiling on model calls per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Corrections shown to the model per email
    #[serde(default = "default_max_corrections")]
    pub max_corrections: usize,
    /// Corrections loaded from history per run
    #[serde(default = "default_correction_pool")]
    pub correction_pool: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            confidence_threshold: default_confidence_threshold(),
            body_char_limit: default_body_char_limit(),
            snippet_char_limit: default_snippet_char_limit(),
            max_iterations: default_max_iterations(),
            max_corrections: default_max_corrections(),
            correction_pool: default_correction_pool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GmailConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
    /// Base search; the unread filter and processed-label exclusion are appended
    #[serde(default = "default_inbox_query")]
    pub inbox_query: String,
    /// Applied to every handled email so it is never collected again
    #[serde(default = "default_processed_label")]
    pub processed_label: String,
    #[serde(default = "default_urgent_label")]
    pub urgent_label: String,
    #[serde(default = "default_personal_label")]
    pub personal_label: String,
    #[serde(default = "default_informational_label")]
    pub informational_label: String,
    #[serde(default = "default_promotional_label")]
    pub promotional_label: String,
    #[serde(default = "default_noise_label")]
    pub noise_label: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            token_cache_path: default_token_cache_path(),
            inbox_query: default_inbox_query(),
            processed_label: default_processed_label(),
            urgent_label: default_urgent_label(),
            personal_label: default_personal_label(),
            informational_label: default_informational_label(),
            promotional_label: default_promotional_label(),
            noise_label: default_noise_label(),
        }
    }
}

impl GmailConfig {
    pub fn label_for(&self, category: EmailCategory) -> &str {
        match category {
            EmailCategory::Urgent => &self.urgent_label,
            EmailCategory::Personal => &self.personal_label,
            EmailCategory::Informational => &self.informational_label,
            EmailCategory::Promotional => &self.promotional_label,
            EmailCategory::Noise => &self.noise_label,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".email-janitor/state.json")
}

fn default_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_api_base() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.4
}

fn default_request_timeout() -> u64 {
    120
}

fn default_confidence_threshold() -> f64 {
    4.0
}

fn default_body_char_limit() -> usize {
    2000
}

fn default_snippet_char_limit() -> usize {
    500
}

fn default_max_iterations() -> usize {
    100
}

fn default_max_corrections() -> usize {
    10
}

fn default_correction_pool() -> usize {
    50
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".email-janitor/token.json")
}

fn default_inbox_query() -> String {
    "in:inbox -in:sent".to_string()
}

fn default_processed_label() -> String {
    "janitor/done".to_string()
}

fn default_urgent_label() -> String {
    "janitor/urgent".to_string()
}

fn default_personal_label() -> String {
    "janitor/personal".to_string()
}

fn default_informational_label() -> String {
    "janitor/newsletters".to_string()
}

fn default_promotional_label() -> String {
    "janitor/promotions".to_string()
}

fn default_noise_label() -> String {
    "janitor/noise".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("email_janitor.db")
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| JanitorError::ConfigError(format!("Invalid value for {}: {}", key, e)))
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| JanitorError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| JanitorError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from file, then apply environment overrides and validate again.
    pub async fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override values from `EMAIL_JANITOR_*`, `EMAIL_CLASSIFIER_*`, `GMAIL_*`
    /// and `DATABASE_*` variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("EMAIL_JANITOR_POLL_INTERVAL") {
            self.app.poll_interval_secs = parse_env("EMAIL_JANITOR_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("EMAIL_JANITOR_STATE_FILE") {
            self.app.state_file = PathBuf::from(v);
        }

        if let Some(v) = get("EMAIL_CLASSIFIER_MODEL") {
            self.classifier.model = v;
        }
        if let Some(v) = get("EMAIL_CLASSIFIER_API_BASE") {
            self.classifier.api_base = v;
        }
        if let Some(v) = get("EMAIL_CLASSIFIER_CONFIDENCE_THRESHOLD") {
            self.classifier.confidence_threshold =
                parse_env("EMAIL_CLASSIFIER_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("EMAIL_CLASSIFIER_MAX_ITERATIONS") {
            self.classifier.max_iterations = parse_env("EMAIL_CLASSIFIER_MAX_ITERATIONS", &v)?;
        }

        if let Some(v) = get("GMAIL_INBOX_QUERY") {
            self.gmail.inbox_query = v;
        }
        if let Some(v) = get("GMAIL_PROCESSED_LABEL") {
            self.gmail.processed_label = v;
        }
        if let Some(v) = get("GMAIL_URGENT_LABEL") {
            self.gmail.urgent_label = v;
        }
        if let Some(v) = get("GMAIL_PERSONAL_LABEL") {
            self.gmail.personal_label = v;
        }
        if let Some(v) = get("GMAIL_INFORMATIONAL_LABEL") {
            self.gmail.informational_label = v;
        }
        if let Some(v) = get("GMAIL_PROMOTIONAL_LABEL") {
            self.gmail.promotional_label = v;
        }
        if let Some(v) = get("GMAIL_NOISE_LABEL") {
            self.gmail.noise_label = v;
        }

        if let Some(v) = get("DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }

        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                JanitorError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| JanitorError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| JanitorError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.app.poll_interval_secs == 0 {
            return Err(JanitorError::ConfigError(
                "app.poll_interval_secs must be at least 1".to_string(),
            ));
        }

        let classifier = &self.classifier;
        if classifier.model.trim().is_empty() {
            return Err(JanitorError::ConfigError(
                "classifier.model cannot be empty".to_string(),
            ));
        }
        if !(CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&classifier.confidence_threshold) {
            return Err(JanitorError::ConfigError(format!(
                "classifier.confidence_threshold must be between {} and {}",
                CONFIDENCE_MIN, CONFIDENCE_MAX
            )));
        }
        if !(0.0..=2.0).contains(&classifier.temperature) {
            return Err(JanitorError::ConfigError(
                "classifier.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if classifier.request_timeout_secs == 0 {
            return Err(JanitorError::ConfigError(
                "classifier.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if classifier.max_iterations == 0 {
            return Err(JanitorError::ConfigError(
                "classifier.max_iterations must be at least 1".to_string(),
            ));
        }
        if classifier.body_char_limit == 0 || classifier.snippet_char_limit == 0 {
            return Err(JanitorError::ConfigError(
                "classifier character limits must be at least 1".to_string(),
            ));
        }

        let gmail = &self.gmail;
        if gmail.processed_label.trim().is_empty() {
            return Err(JanitorError::ConfigError(
                "gmail.processed_label cannot be empty".to_string(),
            ));
        }
        for category in EmailCategory::ALL {
            let label = gmail.label_for(category);
            if label.trim().is_empty() {
                return Err(JanitorError::ConfigError(format!(
                    "gmail label for {} cannot be empty",
                    category
                )));
            }
            if label.eq_ignore_ascii_case(&gmail.processed_label) {
                return Err(JanitorError::ConfigError(format!(
                    "gmail label for {} must differ from gmail.processed_label",
                    category
                )));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }
}
