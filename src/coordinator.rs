//! Per-email classification loop.
//!
//! The coordinator owns no run data of its own. Every step reads and writes
//! the [`RunState`] it is handed, so a run interrupted at any point can be
//! resumed from whatever the [`StateStore`] last recorded.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::accumulator::accumulate;
use crate::config::ClassifierConfig;
use crate::error::{JanitorError, Result};
use crate::instructions::build_instruction;
use crate::mailbox::Mailbox;
use crate::model::ClassifierModel;
use crate::models::{
    ClassificationCollection, ClassificationInput, ClassificationOutput, ClassificationResult,
    CorrectionRecord, EmailRecord,
};
use crate::parser::parse_classification;
use crate::relevance::select_relevant_corrections;
use crate::state::{LoopCursor, RunPhase, RunState, StateStore};

/// Source of full message bodies for emails collected without one
#[async_trait]
pub trait BodySource: Send + Sync {
    async fn fetch_body(&self, email_id: &str) -> Result<Option<String>>;
}

#[async_trait]
impl<T: Mailbox + ?Sized> BodySource for T {
    async fn fetch_body(&self, email_id: &str) -> Result<Option<String>> {
        Mailbox::fetch_body(self, email_id).await
    }
}

/// Used when bodies cannot be looked up; the snippet stands in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBodySource;

#[async_trait]
impl BodySource for NoBodySource {
    async fn fetch_body(&self, _email_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// What a single loop step produced
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// One more email was classified
    Classified(ClassificationResult),
    /// No emails remain; carries the final collection
    Exhausted(ClassificationCollection),
}

pub struct ClassificationCoordinator<M> {
    model: M,
    config: ClassifierConfig,
    corrections: Vec<CorrectionRecord>,
}

impl<M: ClassifierModel> ClassificationCoordinator<M> {
    pub fn new(model: M, config: ClassifierConfig) -> Self {
        Self {
            model,
            config,
            corrections: Vec::new(),
        }
    }

    /// Past corrections, newest first, to draw few-shot examples from.
    pub fn with_corrections(mut self, corrections: Vec<CorrectionRecord>) -> Self {
        self.corrections = corrections;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Prepare the run for iteration.
    ///
    /// Safe to call any number of times: the cursor is only created when
    /// absent, so a run already part-way through keeps its position.
    pub async fn initialize(&self, state: &mut RunState, store: &dyn StateStore) -> Result<()> {
        let batch = match state.batch.as_ref() {
            Some(batch) => batch,
            None => {
                error!("No emails found: the collector must run before classification");
                return Err(JanitorError::MissingBatch);
            }
        };

        if let Err(e) = batch.validate() {
            error!("Refusing to classify: {}", e);
            return Err(e);
        }

        if state.cursor.is_some() {
            return Ok(());
        }

        let total = batch.count;
        state.cursor = Some(LoopCursor { index: 0, total });
        if total == 0 {
            info!("No emails to process");
            state.phase = RunPhase::Exhausted;
            state.completed_at = Some(chrono::Utc::now());
        } else {
            info!("Classifying {} emails (run {})", total, state.run_id);
            state.phase = RunPhase::Iterating;
        }
        state.touch();
        store.save(state).await
    }

    /// Classify the email under the cursor, or report that none remain.
    pub async fn step(
        &self,
        state: &mut RunState,
        store: &dyn StateStore,
        bodies: &dyn BodySource,
    ) -> Result<StepOutcome> {
        self.initialize(state, store).await?;

        let cursor = state
            .cursor
            .ok_or_else(|| JanitorError::StateError("loop cursor missing".to_string()))?;

        if cursor.is_exhausted() || state.iterations >= self.config.max_iterations {
            return self.finish(state, store, cursor).await;
        }

        let record = state
            .batch
            .as_ref()
            .and_then(|b| b.emails.get(cursor.index))
            .cloned()
            .ok_or_else(|| {
                JanitorError::StateError(format!("no email at index {}", cursor.index))
            })?;

        let result = self.classify(&record, bodies).await;
        info!(
            email_id = %result.email_id,
            sender = %result.sender,
            category = %result.category,
            confidence = result.confidence,
            "Classified email {}/{}",
            cursor.index + 1,
            cursor.total
        );

        accumulate(state, result.clone(), store).await?;
        Ok(StepOutcome::Classified(result))
    }

    /// Step until exhausted, calling `on_result` for every classified email.
    pub async fn run_to_completion<F>(
        &self,
        state: &mut RunState,
        store: &dyn StateStore,
        bodies: &dyn BodySource,
        mut on_result: F,
    ) -> Result<ClassificationCollection>
    where
        F: FnMut(&ClassificationResult),
    {
        loop {
            match self.step(state, store, bodies).await? {
                StepOutcome::Classified(result) => on_result(&result),
                StepOutcome::Exhausted(collection) => return Ok(collection),
            }
        }
    }

    async fn finish(
        &self,
        state: &mut RunState,
        store: &dyn StateStore,
        cursor: LoopCursor,
    ) -> Result<StepOutcome> {
        if state.phase != RunPhase::Exhausted {
            if !cursor.is_exhausted() {
                warn!(
                    "Stopping after {} model calls; {} emails left for the next run",
                    state.iterations,
                    cursor.remaining()
                );
                state.halted_by_ceiling = true;
            }
            state.phase = RunPhase::Exhausted;
            state.completed_at = Some(chrono::Utc::now());
            state.touch();
            store.save(state).await?;
            info!(
                "Classification loop finished: {} emails classified",
                state.collection.count
            );
        }

        Ok(StepOutcome::Exhausted(state.collection.clone()))
    }

    async fn classify(&self, record: &EmailRecord, bodies: &dyn BodySource) -> ClassificationResult {
        let body = resolve_body(record, bodies).await;
        let input = ClassificationInput::from_record(
            record,
            body,
            self.config.body_char_limit,
            self.config.snippet_char_limit,
        );

        let relevant = select_relevant_corrections(
            &self.corrections,
            &record.sender,
            self.config.max_corrections,
        );
        if !relevant.is_empty() {
            debug!(email_id = %record.id, examples = relevant.len(), "Adding correction examples");
        }

        let output = match build_instruction(&input, Some(relevant.as_slice())) {
            Ok(prompt) => match self.model.complete(&prompt).await {
                Ok(raw) => parse_classification(&raw),
                Err(e) => {
                    warn!(email_id = %record.id, "Model call failed: {}", e);
                    ClassificationOutput::fallback(format!("Model error: no response ({})", e))
                }
            },
            Err(e) => {
                warn!(email_id = %record.id, "Could not build prompt: {}", e);
                ClassificationOutput::fallback(format!("Prompt error: {}", e))
            }
        };

        ClassificationResult::from_output(record, output)
    }
}

/// Record body, then a lookup, then the snippet.
async fn resolve_body(record: &EmailRecord, bodies: &dyn BodySource) -> Option<String> {
    if let Some(body) = record.body.as_ref().filter(|b| !b.trim().is_empty()) {
        return Some(body.clone());
    }

    match bodies.fetch_body(&record.id).await {
        Ok(Some(body)) if !body.trim().is_empty() => Some(body),
        Ok(_) => record.snippet.clone(),
        Err(e) => {
            warn!(email_id = %record.id, "Body lookup failed, using snippet: {}", e);
            record.snippet.clone()
        }
    }
}
