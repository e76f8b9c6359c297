//! Applies category labels to classified emails.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::GmailConfig;
use crate::error::{JanitorError, Result};
use crate::mailbox::{Mailbox, INBOX_LABEL_ID};
use crate::models::{
    ClassificationCollection, ClassificationResult, ProcessingResult, ProcessingStatus,
    ProcessingSummary,
};

/// Labels each classified email and archives the ones that should leave the inbox
pub struct Labeler<'a> {
    mailbox: &'a dyn Mailbox,
    gmail: GmailConfig,
    label_cache: HashMap<String, String>, // lowercase name -> id
    cache_loaded: bool,
    dry_run: bool,
}

impl<'a> Labeler<'a> {
    pub fn new(mailbox: &'a dyn Mailbox, gmail: GmailConfig) -> Self {
        Self {
            mailbox,
            gmail,
            label_cache: HashMap::new(),
            cache_loaded: false,
            dry_run: false,
        }
    }

    /// Plan actions without touching the mailbox
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Loads existing labels into the cache
    pub async fn load_existing_labels(&mut self) -> Result<usize> {
        let labels = self.mailbox.list_labels().await?;
        let count = labels.len();
        for label in labels {
            self.label_cache.insert(label.name.to_lowercase(), label.id);
        }
        self.cache_loaded = true;
        debug!("Loaded {} existing labels into cache", count);
        Ok(count)
    }

    /// Gets label ID by name, creating it and any missing parents if necessary
    pub async fn get_or_create_label(&mut self, name: &str) -> Result<String> {
        if !self.cache_loaded {
            self.load_existing_labels().await?;
        }

        if let Some(id) = self.label_cache.get(&name.to_lowercase()) {
            return Ok(id.clone());
        }

        let parts: Vec<&str> = name.split('/').collect();
        for i in 1..parts.len() {
            let parent = parts[..i].join("/");
            if !self.label_cache.contains_key(&parent.to_lowercase()) {
                self.create(&parent).await?;
            }
        }

        self.create(name).await
    }

    async fn create(&mut self, name: &str) -> Result<String> {
        info!("Creating label: {}", name);
        let id = self.mailbox.create_label(name).await.map_err(|e| {
            JanitorError::LabelError(format!("Failed to create label '{}': {}", name, e))
        })?;
        self.label_cache.insert(name.to_lowercase(), id.clone());
        Ok(id)
    }

    /// Label every classified email. Failures are recorded, never propagated.
    pub async fn apply(&mut self, collection: &ClassificationCollection) -> ProcessingSummary {
        let mut summary = ProcessingSummary::default();

        for result in &collection.classifications {
            let outcome = self.apply_one(result).await;
            if let Some(error) = &outcome.error {
                warn!(email_id = %outcome.email_id, "Failed to label email: {}", error);
            }
            summary.record(outcome);
        }

        info!(
            "Labeled {} emails ({} errors)",
            summary.total_processed - summary.errors_count,
            summary.errors_count
        );
        summary
    }

    async fn apply_one(&mut self, result: &ClassificationResult) -> ProcessingResult {
        let label = self.gmail.label_for(result.category).to_string();
        let archived = result.category.archives();

        let mut outcome = ProcessingResult {
            email_id: result.email_id.clone(),
            category: result.category,
            applied_label: label.clone(),
            archived,
            status: ProcessingStatus::Success,
            error: None,
        };

        if self.dry_run {
            outcome.status = ProcessingStatus::Planned;
            return outcome;
        }

        if let Err(e) = self.label_message(&result.email_id, &label, archived).await {
            outcome.status = ProcessingStatus::Error;
            outcome.error = Some(e.to_string());
        }
        outcome
    }

    async fn label_message(&mut self, email_id: &str, label: &str, archive: bool) -> Result<()> {
        let processed_label = self.gmail.processed_label.clone();
        let add = vec![
            self.get_or_create_label(label).await?,
            self.get_or_create_label(&processed_label).await?,
        ];
        let remove = if archive {
            vec![INBOX_LABEL_ID.to_string()]
        } else {
            Vec::new()
        };

        self.mailbox.modify_labels(email_id, &add, &remove).await
    }
}
