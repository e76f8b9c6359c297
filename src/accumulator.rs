//! Merging one iteration's result into the run state.

use crate::error::{JanitorError, Result};
use crate::models::ClassificationResult;
use crate::state::{LoopCursor, RunState, StateStore};
use chrono::{DateTime, Utc};

/// Append `result` to the run's collection and advance the cursor by one.
///
/// Two durable writes: the collection first, then the cursor. A crash
/// between them leaves the collection one ahead of the cursor, which
/// [`RunState::reconcile`] repairs on resume.
///
/// If either write fails the in-memory state is restored to what it was on
/// entry, so stepping the same state again classifies the email once.
pub async fn accumulate(
    state: &mut RunState,
    result: ClassificationResult,
    store: &dyn StateStore,
) -> Result<()> {
    if state.cursor.is_none() {
        return Err(JanitorError::StateError(
            "cannot accumulate before the loop cursor is initialised".to_string(),
        ));
    }

    let entry = Checkpoint::of(state);

    state.collection.push(result);
    state.touch();
    if let Err(e) = store.save(state).await {
        entry.restore(state);
        return Err(e);
    }

    if let Some(cursor) = state.cursor.as_mut() {
        cursor.index += 1;
    }
    state.iterations += 1;
    state.touch();
    if let Err(e) = store.save(state).await {
        entry.restore(state);
        return Err(e);
    }

    tracing::debug!(
        run_id = %state.run_id,
        classified = state.collection.count,
        cursor = ?state.cursor,
        "Accumulated classification"
    );

    Ok(())
}

/// The fields `accumulate` touches, as they were before it ran
struct Checkpoint {
    count: usize,
    cursor: Option<LoopCursor>,
    iterations: usize,
    updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn of(state: &RunState) -> Self {
        Self {
            count: state.collection.count,
            cursor: state.cursor,
            iterations: state.iterations,
            updated_at: state.updated_at,
        }
    }

    fn restore(self, state: &mut RunState) {
        tracing::warn!(
            run_id = %state.run_id,
            "State write failed; discarding unrecorded classification"
        );
        state.collection.truncate(self.count);
        state.cursor = self.cursor;
        state.iterations = self.iterations;
        state.updated_at = self.updated_at;
    }
}
