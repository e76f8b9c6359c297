//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use email_janitor::error::{JanitorError, Result};
use email_janitor::mailbox::{LabelInfo, Mailbox};
use email_janitor::model::ClassifierModel;
use email_janitor::models::{CorrectionRecord, EmailBatch, EmailRecord};
use mockall::mock;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Create a test email with a snippet and the usual inbox labels
pub fn create_test_email(id: &str, sender: &str, subject: &str) -> EmailRecord {
    let mut email = EmailRecord::new(id, sender, subject);
    email.snippet = Some(format!("Snippet for {}", subject));
    email.labels = vec!["INBOX".to_string(), "UNREAD".to_string()];
    email.thread_id = Some(format!("thread_{}", id));
    email.recipient = Some("me@example.com".to_string());
    email.received_at = Some(Utc::now());
    email
}

/// A batch of `n` emails with ids m0..m{n-1}
pub fn create_batch(n: usize) -> EmailBatch {
    EmailBatch::new(
        (0..n)
            .map(|i| {
                create_test_email(
                    &format!("m{}", i),
                    &format!("sender{}@example.com", i),
                    &format!("Subject {}", i),
                )
            })
            .collect(),
    )
}

pub fn create_correction(
    sender: &str,
    subject: &str,
    original: &str,
    corrected: &str,
    note: Option<&str>,
) -> CorrectionRecord {
    CorrectionRecord {
        sender: sender.to_string(),
        subject: subject.to_string(),
        original_classification: original.to_string(),
        corrected_classification: corrected.to_string(),
        note: note.map(|n| n.to_string()),
        corrected_at: Utc::now(),
    }
}

/// Model reply in the requested JSON shape
pub fn classification_json(category: &str, confidence: u8) -> String {
    json!({
        "category": category,
        "reasoning": format!("Looks {}", category.to_lowercase()),
        "confidence": confidence,
        "keywords_found": ["test"]
    })
    .to_string()
}

/// The same reply wrapped in a Markdown code fence, as chat models often send it
pub fn fenced(body: &str) -> String {
    format!("```json\n{}\n```", body)
}

/// Labels that already exist in the test mailbox, matching the default config
pub fn default_labels() -> Vec<LabelInfo> {
    [
        ("INBOX", "INBOX"),
        ("L_root", "janitor"),
        ("L_urgent", "janitor/urgent"),
        ("L_personal", "janitor/personal"),
        ("L_news", "janitor/newsletters"),
        ("L_promo", "janitor/promotions"),
        ("L_noise", "janitor/noise"),
        ("L_done", "janitor/done"),
    ]
    .iter()
    .map(|(id, name)| LabelInfo {
        id: id.to_string(),
        name: name.to_string(),
    })
    .collect()
}

/// Replays canned responses in order, then answers with an empty string.
pub struct ScriptedModel {
    responses: Mutex<Vec<Result<String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().rev().collect()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always returns the same reply
    pub fn repeating(reply: &str, times: usize) -> Self {
        Self::new((0..times).map(|_| Ok(reply.to_string())).collect())
    }

    pub fn failing(times: usize) -> Self {
        Self::new(
            (0..times)
                .map(|_| Err(JanitorError::ModelError("connection refused".to_string())))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassifierModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Ok(String::new()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// Mock implementation of Mailbox for testing
mock! {
    pub Mailbox {}

    #[async_trait]
    impl Mailbox for Mailbox {
        async fn fetch_unread(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>>;
        async fn fetch_body(&self, message_id: &str) -> Result<Option<String>>;
        async fn list_labels(&self) -> Result<Vec<LabelInfo>>;
        async fn create_label(&self, name: &str) -> Result<String>;
        async fn modify_labels(
            &self,
            message_id: &str,
            add_label_ids: &[String],
            remove_label_ids: &[String],
        ) -> Result<()>;
    }
}

// Mock implementation of ClassifierModel for testing
mock! {
    pub Model {}

    #[async_trait]
    impl ClassifierModel for Model {
        async fn complete(&self, prompt: &str) -> Result<String>;
        fn name(&self) -> &str;
    }
}
