//! End-to-end scenarios for the classification loop

mod common;

use common::*;
use email_janitor::config::{ClassifierConfig, GmailConfig};
use email_janitor::coordinator::{ClassificationCoordinator, NoBodySource, StepOutcome};
use email_janitor::labeler::Labeler;
use email_janitor::models::{EmailBatch, EmailCategory, ProcessingStatus};
use email_janitor::state::{
    resume_or_new, JsonStateFile, LoopCursor, MemoryStateStore, RunPhase, RunState, StateStore,
};
use email_janitor::ClassificationResult;
use mockall::predicate::*;
use std::collections::HashSet;
use tempfile::TempDir;

fn coordinator(model: ScriptedModel) -> ClassificationCoordinator<ScriptedModel> {
    ClassificationCoordinator::new(model, ClassifierConfig::default())
}

fn assert_unique_ids(results: &[ClassificationResult]) {
    let ids: HashSet<&str> = results.iter().map(|r| r.email_id.as_str()).collect();
    assert_eq!(ids.len(), results.len(), "duplicate email ids in collection");
}

#[tokio::test]
async fn test_fenced_reply_then_garbage() {
    let batch = EmailBatch::new(vec![
        create_test_email("m1", "boss@work.com", "Contract due tomorrow"),
        create_test_email("m2", "deals@shop.com", "50% off"),
    ]);
    let mut model = MockModel::new();
    let mut seq = mockall::Sequence::new();
    model
        .expect_complete()
        .withf(|prompt| prompt.contains("boss@work.com"))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(fenced(&classification_json("URGENT", 5))));
    model
        .expect_complete()
        .withf(|prompt| prompt.contains("deals@shop.com"))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok("not json at all".to_string()));

    let coordinator = ClassificationCoordinator::new(model, ClassifierConfig::default());
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(batch);

    let mut seen = Vec::new();
    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |r| seen.push(r.email_id.clone()))
        .await
        .unwrap();

    assert_eq!(seen, vec!["m1", "m2"]);
    assert_eq!(collection.count, 2);

    let first = &collection.classifications[0];
    assert_eq!(first.category, EmailCategory::Urgent);
    assert_eq!(first.confidence, 5.0);
    assert_eq!(first.keywords_found, vec!["test"]);

    let second = &collection.classifications[1];
    assert_eq!(second.category, EmailCategory::Noise);
    assert_eq!(second.confidence, 1.0);
    assert!(second.reasoning.starts_with("Parsing error"));

    assert_eq!(state.cursor, Some(LoopCursor { index: 2, total: 2 }));
    assert_eq!(state.phase, RunPhase::Exhausted);

    // Stepping an exhausted run keeps answering with the same collection
    let again = coordinator.step(&mut state, &store, &NoBodySource).await.unwrap();
    assert_eq!(again, StepOutcome::Exhausted(collection));
}

#[tokio::test]
async fn test_reply_without_confidence_then_plain_text() {
    let coordinator = coordinator(ScriptedModel::new(vec![
        Ok("```json\n{\"category\":\"NOISE\",\"reasoning\":\"spam\"}\n```".to_string()),
        Ok("not json at all".to_string()),
    ]));
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(create_batch(2));

    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    assert_eq!(collection.count, 2);
    assert_eq!(collection.classifications[0].category, EmailCategory::Noise);
    assert_eq!(collection.classifications[0].reasoning, "spam");
    assert!(collection.classifications[0].confidence > 1.0);

    let fallback = &collection.classifications[1];
    assert_eq!(fallback.category, EmailCategory::Noise);
    assert_eq!(fallback.confidence, 1.0);
    assert!(fallback.reasoning.to_lowercase().contains("error"));
    assert!(fallback.reasoning.contains("unable to parse"));
}

#[tokio::test]
async fn test_failing_model_still_terminates() {
    let model = ScriptedModel::failing(4);
    let coordinator = coordinator(model);
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(create_batch(4));

    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    assert_eq!(collection.count, 4);
    assert_eq!(coordinator.model().calls(), 4);
    for result in &collection.classifications {
        assert_eq!(result.category, EmailCategory::Noise);
        assert_eq!(result.confidence, 1.0);
        assert!(result.reasoning.contains("connection refused"));
    }
    assert_unique_ids(&collection.classifications);
}

#[tokio::test]
async fn test_empty_batch_makes_no_model_calls() {
    let mut model = MockModel::new();
    model.expect_complete().never();

    let coordinator = ClassificationCoordinator::new(model, ClassifierConfig::default());
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(EmailBatch::empty());

    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    assert_eq!(collection.count, 0);
    assert!(state.is_complete());
    assert_eq!(state.cursor, Some(LoopCursor { index: 0, total: 0 }));
}

#[tokio::test]
async fn test_resume_after_interruption_classifies_each_email_once() {
    let dir = TempDir::new().unwrap();
    let store = JsonStateFile::new(dir.path().join("state.json"));
    let reply = classification_json("INFORMATIONAL", 4);

    // First process: classify one email and stop
    {
        let coordinator = coordinator(ScriptedModel::repeating(&reply, 1));
        let mut state = RunState::with_batch(create_batch(3));
        let outcome = coordinator.step(&mut state, &store, &NoBodySource).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Classified(_)));
    }

    // Second process picks up where the first left off
    let mut state = resume_or_new(&store, true).await.unwrap();
    assert_eq!(state.cursor, Some(LoopCursor { index: 1, total: 3 }));

    let coordinator = coordinator(ScriptedModel::repeating(&reply, 2));
    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    assert_eq!(coordinator.model().calls(), 2);
    assert_eq!(collection.count, 3);
    let ids: Vec<&str> = collection
        .classifications
        .iter()
        .map(|r| r.email_id.as_str())
        .collect();
    assert_eq!(ids, vec!["m0", "m1", "m2"]);
}

#[tokio::test]
async fn test_crash_between_collection_and_cursor_writes() {
    let dir = TempDir::new().unwrap();
    let store = JsonStateFile::new(dir.path().join("state.json"));
    let reply = classification_json("PERSONAL", 5);

    // Classify two emails, then wind the cursor back one step as if the
    // process died after the collection write but before the cursor write.
    let mut state = RunState::with_batch(create_batch(3));
    let first = coordinator(ScriptedModel::repeating(&reply, 2));
    first.step(&mut state, &store, &NoBodySource).await.unwrap();
    first.step(&mut state, &store, &NoBodySource).await.unwrap();
    state.cursor = Some(LoopCursor { index: 1, total: 3 });
    state.iterations = 1;
    store.save(&state).await.unwrap();

    let mut resumed = resume_or_new(&store, true).await.unwrap();
    assert_eq!(resumed.cursor, Some(LoopCursor { index: 2, total: 3 }));

    let second = coordinator(ScriptedModel::repeating(&reply, 3));
    let collection = second
        .run_to_completion(&mut resumed, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    assert_eq!(second.model().calls(), 1, "only the unclassified email is sent");
    assert_eq!(collection.count, 3);
    assert_unique_ids(&collection.classifications);
}

#[tokio::test]
async fn test_initialize_does_not_rewind_a_loaded_run() {
    let dir = TempDir::new().unwrap();
    let store = JsonStateFile::new(dir.path().join("state.json"));

    let mut state = RunState::with_batch(create_batch(3));
    state.cursor = Some(LoopCursor { index: 2, total: 3 });
    state.phase = RunPhase::Iterating;
    store.save(&state).await.unwrap();

    let mut loaded = store.load().await.unwrap().unwrap();
    let coordinator = coordinator(ScriptedModel::new(vec![]));
    coordinator.initialize(&mut loaded, &store).await.unwrap();
    coordinator.initialize(&mut loaded, &store).await.unwrap();

    assert_eq!(loaded.cursor, Some(LoopCursor { index: 2, total: 3 }));
}

#[tokio::test]
async fn test_ceiling_leaves_rest_for_next_run() {
    let config = ClassifierConfig {
        max_iterations: 2,
        ..ClassifierConfig::default()
    };
    let coordinator = ClassificationCoordinator::new(
        ScriptedModel::repeating(&classification_json("NOISE", 5), 5),
        config,
    );
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(create_batch(5));

    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    assert_eq!(collection.count, 2);
    assert!(state.halted_by_ceiling);
    assert!(state.is_complete());
    assert_eq!(state.cursor.unwrap().remaining(), 3);
}

#[tokio::test]
async fn test_relevant_corrections_reach_the_prompt() {
    let corrections = vec![
        create_correction("other@else.com", "Hi", "NOISE", "PERSONAL", None),
        create_correction(
            "alerts@bank.com",
            "Statement ready",
            "NOISE",
            "INFORMATIONAL",
            Some("Bank statements are kept"),
        ),
    ];
    let model = ScriptedModel::repeating(&classification_json("INFORMATIONAL", 4), 1);
    let config = ClassifierConfig {
        max_corrections: 1,
        ..ClassifierConfig::default()
    };
    let coordinator = ClassificationCoordinator::new(model, config).with_corrections(corrections);
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(EmailBatch::new(vec![create_test_email(
        "m1",
        "Bank Alerts <alerts@bank.com>",
        "Your statement",
    )]));

    coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    let prompts = coordinator.model().prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("EXAMPLES FROM PREVIOUS CORRECTIONS:"));
    assert!(prompt.contains("Reviewer note: Bank statements are kept"));
    assert!(!prompt.contains("other@else.com"), "only the most relevant example is kept");
    let examples_at = prompt.find("EXAMPLES FROM PREVIOUS CORRECTIONS:").unwrap();
    let email_at = prompt.find("--- EMAIL TO CLASSIFY ---").unwrap();
    assert!(examples_at < email_at);
}

#[tokio::test]
async fn test_body_lookup_failure_falls_back_to_snippet() {
    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_fetch_body()
        .with(eq("m1"))
        .times(1)
        .returning(|_| Err(email_janitor::JanitorError::NetworkError("reset".to_string())));

    let model = ScriptedModel::repeating(&classification_json("PROMOTIONAL", 4), 1);
    let coordinator = coordinator(model);
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(EmailBatch::new(vec![create_test_email(
        "m1",
        "deals@shop.com",
        "Weekend sale",
    )]));

    coordinator
        .run_to_completion(&mut state, &store, &mailbox, |_| {})
        .await
        .unwrap();

    let prompt = &coordinator.model().prompts()[0];
    assert!(prompt.contains("Snippet for Weekend sale"));
}

#[tokio::test]
async fn test_labels_follow_the_loop() {
    let batch = EmailBatch::new(vec![
        create_test_email("m1", "mom@family.com", "Dinner Sunday?"),
        create_test_email("m2", "deals@shop.com", "Flash sale"),
    ]);
    let model = ScriptedModel::new(vec![
        Ok(classification_json("PERSONAL", 5)),
        Ok(classification_json("PROMOTIONAL", 4)),
    ]);
    let coordinator = coordinator(model);
    let store = MemoryStateStore::new();
    let mut state = RunState::with_batch(batch);
    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    let mut mailbox = MockMailbox::new();
    mailbox
        .expect_list_labels()
        .times(1)
        .returning(|| Ok(default_labels()));
    mailbox
        .expect_modify_labels()
        .withf(|id, add, remove| {
            id == "m1"
                && add == ["L_personal".to_string(), "L_done".to_string()]
                && remove.is_empty()
        })
        .times(1)
        .returning(|_, _, _| Ok(()));
    mailbox
        .expect_modify_labels()
        .withf(|id, add, remove| {
            id == "m2"
                && add == ["L_promo".to_string(), "L_done".to_string()]
                && remove == ["INBOX".to_string()]
        })
        .times(1)
        .returning(|_, _, _| Ok(()));

    let summary = Labeler::new(&mailbox, GmailConfig::default())
        .apply(&collection)
        .await;

    assert_eq!(summary.total_processed, 2);
    assert_eq!(summary.errors_count, 0);
    assert!(summary
        .results
        .iter()
        .all(|r| r.status == ProcessingStatus::Success));
    assert!(!summary.results[0].archived);
    assert!(summary.results[1].archived);
}

/// Memory store whose `fail_on`-th save (1-based) returns an error
struct FlakyStore {
    inner: MemoryStateStore,
    fail_on: usize,
    attempts: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl StateStore for FlakyStore {
    async fn load(&self) -> email_janitor::Result<Option<RunState>> {
        self.inner.load().await
    }

    async fn save(&self, state: &RunState) -> email_janitor::Result<()> {
        let attempt = self
            .attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if attempt == self.fail_on {
            return Err(email_janitor::JanitorError::StateError(
                "write failed".to_string(),
            ));
        }
        self.inner.save(state).await
    }

    async fn clear(&self) -> email_janitor::Result<()> {
        self.inner.clear().await
    }
}

#[tokio::test]
async fn test_failed_state_write_does_not_duplicate_on_retry() {
    // Save 1 initialises the cursor, save 2 records m0
    let store = FlakyStore {
        inner: MemoryStateStore::new(),
        fail_on: 2,
        attempts: Default::default(),
    };
    let coordinator = coordinator(ScriptedModel::repeating(&classification_json("NOISE", 4), 3));
    let mut state = RunState::with_batch(create_batch(2));

    let err = coordinator
        .step(&mut state, &store, &NoBodySource)
        .await
        .unwrap_err();
    assert!(matches!(err, email_janitor::JanitorError::StateError(_)));
    assert_eq!(state.collection.count, 0);
    assert_eq!(state.cursor, Some(LoopCursor { index: 0, total: 2 }));
    assert_eq!(store.inner.snapshot().unwrap().collection.count, 0);

    let collection = coordinator
        .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
        .await
        .unwrap();

    let ids: Vec<&str> = collection
        .classifications
        .iter()
        .map(|c| c.email_id.as_str())
        .collect();
    assert_eq!(ids, vec!["m0", "m1"]);
    assert_eq!(state.iterations, 2);
    assert_eq!(coordinator.model().calls(), 3);
}
