use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{JanitorError, Result};

/// Lowest confidence a classification can carry
pub const CONFIDENCE_MIN: f64 = 1.0;
/// Highest confidence a classification can carry
pub const CONFIDENCE_MAX: f64 = 5.0;
/// Confidence substituted when the model output could not be used
pub const CONFIDENCE_UNSURE: f64 = 1.0;
/// Confidence assumed when the model omits it
pub const CONFIDENCE_DEFAULT: f64 = 3.0;

/// Closed set of categories, in priority order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmailCategory {
    Urgent,
    Personal,
    Informational,
    Promotional,
    Noise,
}

impl EmailCategory {
    pub const ALL: [EmailCategory; 5] = [
        EmailCategory::Urgent,
        EmailCategory::Personal,
        EmailCategory::Informational,
        EmailCategory::Promotional,
        EmailCategory::Noise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailCategory::Urgent => "URGENT",
            EmailCategory::Personal => "PERSONAL",
            EmailCategory::Informational => "INFORMATIONAL",
            EmailCategory::Promotional => "PROMOTIONAL",
            EmailCategory::Noise => "NOISE",
        }
    }

    /// Whether the email is taken out of the inbox once labelled
    pub fn archives(&self) -> bool {
        !matches!(self, EmailCategory::Urgent | EmailCategory::Personal)
    }
}

impl fmt::Display for EmailCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailCategory {
    type Err = JanitorError;

    /// Exact, uppercase match only.
    fn from_str(s: &str) -> Result<Self> {
        EmailCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| JanitorError::ConfigError(format!("Unknown category: {}", s)))
    }
}

/// Snapshot of one unread email as produced by the collector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailRecord {
    pub id: String,
    pub sender: String,
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl EmailRecord {
    pub fn new(id: impl Into<String>, sender: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: None,
            snippet: None,
            labels: Vec::new(),
            recipient: None,
            thread_id: None,
            received_at: None,
        }
    }
}

/// Ordered emails collected at the start of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailBatch {
    pub count: usize,
    pub emails: Vec<EmailRecord>,
}

impl EmailBatch {
    pub fn new(emails: Vec<EmailRecord>) -> Self {
        Self {
            count: emails.len(),
            emails,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Count must agree with the records and ids must be unique.
    pub fn validate(&self) -> Result<()> {
        if self.count != self.emails.len() {
            return Err(JanitorError::InvalidBatch(format!(
                "count is {} but batch holds {} emails",
                self.count,
                self.emails.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.emails.len());
        for email in &self.emails {
            if !seen.insert(email.id.as_str()) {
                return Err(JanitorError::InvalidBatch(format!(
                    "duplicate email id {}",
                    email.id
                )));
            }
        }

        Ok(())
    }
}

/// Projection of an email handed to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationInput {
    pub sender: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl ClassificationInput {
    /// Build from an email, capping body and snippet by character count.
    pub fn from_record(
        record: &EmailRecord,
        body: Option<String>,
        body_limit: usize,
        snippet_limit: usize,
    ) -> Self {
        Self {
            sender: record.sender.clone(),
            subject: record.subject.clone(),
            body: body.map(|b| truncate_chars(&b, body_limit)),
            snippet: record
                .snippet
                .as_deref()
                .map(|s| truncate_chars(s, snippet_limit)),
        }
    }
}

/// Keep at most `limit` characters without splitting one.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Structured verdict parsed from the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationOutput {
    pub category: EmailCategory,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub keywords_found: Vec<String>,
}

impl ClassificationOutput {
    /// Low-confidence NOISE verdict used whenever the model output is unusable.
    pub fn fallback(reasoning: impl Into<String>) -> Self {
        Self {
            category: EmailCategory::Noise,
            reasoning: reasoning.into(),
            confidence: CONFIDENCE_UNSURE,
            keywords_found: Vec::new(),
        }
    }

    pub fn is_confidence_valid(confidence: f64) -> bool {
        confidence.is_finite() && (CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&confidence)
    }
}

/// One classified email
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub category: EmailCategory,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub keywords_found: Vec<String>,
    #[serde(default)]
    pub refinement_count: u32,
}

impl ClassificationResult {
    pub fn from_output(record: &EmailRecord, output: ClassificationOutput) -> Self {
        Self {
            email_id: record.id.clone(),
            sender: record.sender.clone(),
            subject: record.subject.clone(),
            category: output.category,
            reasoning: output.reasoning,
            confidence: output.confidence,
            keywords_found: output.keywords_found,
            refinement_count: 0,
        }
    }
}

/// Results accumulated over a run, in classification order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassificationCollection {
    pub count: usize,
    pub classifications: Vec<ClassificationResult>,
}

impl ClassificationCollection {
    pub fn push(&mut self, result: ClassificationResult) {
        self.classifications.push(result);
        self.count = self.classifications.len();
    }

    /// Drop results past the first `len`, keeping `count` in step.
    pub fn truncate(&mut self, len: usize) {
        self.classifications.truncate(len);
        self.count = self.classifications.len();
    }

    pub fn category_counts(&self) -> BTreeMap<EmailCategory, usize> {
        let mut counts = BTreeMap::new();
        for result in &self.classifications {
            *counts.entry(result.category).or_insert(0) += 1;
        }
        counts
    }

    /// Results below `threshold`, in classification order
    pub fn low_confidence(&self, threshold: f64) -> Vec<ClassificationResult> {
        self.classifications
            .iter()
            .filter(|c| c.confidence < threshold)
            .cloned()
            .collect()
    }
}

/// Human correction of an earlier classification
///
/// Categories are kept as text so corrections recorded under older
/// category names are still shown to the model as written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionRecord {
    pub sender: String,
    pub subject: String,
    pub original_classification: String,
    pub corrected_classification: String,
    #[serde(default)]
    pub note: Option<String>,
    pub corrected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Success,
    Planned,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Success => "success",
            ProcessingStatus::Planned => "planned",
            ProcessingStatus::Error => "error",
        }
    }
}

/// Labeling outcome for one email
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResult {
    pub email_id: String,
    pub category: EmailCategory,
    pub applied_label: String,
    pub archived: bool,
    pub status: ProcessingStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcessingResult {
    /// Human-readable action, as stored in the history database
    pub fn action(&self) -> String {
        if let Some(error) = &self.error {
            return format!("Error: {}", error);
        }
        let prefix = if self.status == ProcessingStatus::Planned {
            "Would apply"
        } else {
            "Applied"
        };
        if self.archived {
            format!("{} '{}' label and remove from inbox", prefix, self.applied_label)
        } else {
            format!("{} '{}' label, left in inbox", prefix, self.applied_label)
        }
    }
}

/// Labeling outcome for a whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingSummary {
    pub total_processed: usize,
    pub label_counts: BTreeMap<String, usize>,
    pub errors_count: usize,
    pub results: Vec<ProcessingResult>,
}

impl ProcessingSummary {
    pub fn record(&mut self, result: ProcessingResult) {
        self.total_processed += 1;
        if result.status == ProcessingStatus::Error {
            self.errors_count += 1;
        } else {
            *self
                .label_counts
                .entry(result.applied_label.clone())
                .or_insert(0) += 1;
        }
        self.results.push(result);
    }

    pub fn errors(&self) -> impl Iterator<Item = &ProcessingResult> {
        self.results
            .iter()
            .filter(|r| r.status == ProcessingStatus::Error)
    }
}
