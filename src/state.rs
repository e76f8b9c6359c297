use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{JanitorError, Result};
use crate::models::{ClassificationCollection, EmailBatch};

/// Progress through the batch. Set once per run, only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopCursor {
    pub index: usize,
    pub total: usize,
}

impl LoopCursor {
    pub fn is_exhausted(&self) -> bool {
        self.index >= self.total
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.index)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunPhase {
    AwaitingBatch,
    Iterating,
    Exhausted,
}

/// Everything a run needs to survive a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: RunPhase,
    #[serde(default)]
    pub batch: Option<EmailBatch>,
    #[serde(default)]
    pub cursor: Option<LoopCursor>,
    #[serde(default)]
    pub collection: ClassificationCollection,
    /// Model invocations made so far in this run
    #[serde(default)]
    pub iterations: usize,
    #[serde(default)]
    pub halted_by_ceiling: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            phase: RunPhase::AwaitingBatch,
            batch: None,
            cursor: None,
            collection: ClassificationCollection::default(),
            iterations: 0,
            halted_by_ceiling: false,
            completed_at: None,
        }
    }

    pub fn with_batch(batch: EmailBatch) -> Self {
        let mut state = Self::new();
        state.batch = Some(batch);
        state
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        self.phase == RunPhase::Exhausted
    }

    /// Check if the run can be resumed
    pub fn can_resume(&self) -> bool {
        !self.is_complete() && self.batch.is_some()
    }

    /// Repair a run interrupted between the collection write and the cursor write.
    ///
    /// The collection is written first, so a collection longer than the
    /// cursor means the last classified email was already recorded.
    pub fn reconcile(&mut self) -> bool {
        let Some(cursor) = self.cursor.as_mut() else {
            return false;
        };

        if self.collection.count > cursor.index {
            tracing::warn!(
                "Recovered interrupted run {}: advancing cursor from {} to {}",
                self.run_id,
                cursor.index,
                self.collection.count
            );
            cursor.index = self.collection.count.min(cursor.total);
            self.iterations = self.iterations.max(self.collection.count);
            return true;
        }

        false
    }

    /// Get progress percentage
    pub fn progress_percent(&self) -> f32 {
        match self.cursor {
            Some(cursor) if cursor.total > 0 => (cursor.index as f32 / cursor.total as f32) * 100.0,
            _ if self.is_complete() => 100.0,
            _ => 0.0,
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable home of the run state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<RunState>>;

    async fn save(&self, state: &RunState) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Pick up an unfinished run from `store`, or start a new one.
pub async fn resume_or_new(store: &dyn StateStore, resume: bool) -> Result<RunState> {
    if resume {
        if let Some(mut state) = store.load().await? {
            if state.can_resume() {
                state.reconcile();
                tracing::info!(
                    "Resuming run {} at {:?}, {} classified so far",
                    state.run_id,
                    state.cursor,
                    state.collection.count
                );
                return Ok(state);
            }
            tracing::info!("Previous run {} already finished, starting fresh", state.run_id);
        }
    }

    Ok(RunState::new())
}

/// Run state kept as pretty JSON on disk
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state_error(&self, action: &str, err: impl std::fmt::Display) -> JanitorError {
        JanitorError::StateError(format!(
            "failed to {} {}: {}",
            action,
            self.path.display(),
            err
        ))
    }
}

#[async_trait]
impl StateStore for JsonStateFile {
    async fn load(&self) -> Result<Option<RunState>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tracing::info!("No existing state file found, starting fresh");
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.state_error("read", e))?;
        let state: RunState =
            serde_json::from_str(&json).map_err(|e| self.state_error("parse", e))?;

        tracing::info!(
            "Loaded run state: run_id={}, phase={:?}, classified={}",
            state.run_id,
            state.phase,
            state.collection.count
        );

        Ok(Some(state))
    }

    /// Write to a sibling temp file then rename, so a crash never leaves a torn file.
    async fn save(&self, state: &RunState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.state_error("create directory for", e))?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.state_error("write", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.state_error("replace", e))?;

        tracing::debug!("Saved run state to {:?}", self.path);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.state_error("remove", e)),
        }
    }
}

/// In-process store; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<RunState>>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful saves since creation
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|s| *s).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Option<RunState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<RunState>> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|e| JanitorError::StateError(e.to_string()))
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let mut slot = self
            .state
            .lock()
            .map_err(|e| JanitorError::StateError(e.to_string()))?;
        *slot = Some(state.clone());
        drop(slot);

        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut slot = self
            .state
            .lock()
            .map_err(|e| JanitorError::StateError(e.to_string()))?;
        *slot = None;
        Ok(())
    }
}
