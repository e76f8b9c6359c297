//! Gmail implementation of [`Mailbox`] with retry logic

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use google_gmail1::{
    api::{Label, Message, MessagePart, ModifyMessageRequest},
    hyper_rustls, hyper_util, Gmail,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{JanitorError, Result};
use crate::mailbox::{LabelInfo, Mailbox};
use crate::models::EmailRecord;

pub const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
pub const LABELS_SCOPE: &str = "https://www.googleapis.com/auth/gmail.labels";
const API_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const FETCH_CONCURRENCY: usize = 8;

pub type GmailConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

pub struct GmailMailbox {
    hub: Gmail<GmailConnector>,
}

impl GmailMailbox {
    pub fn new(hub: Gmail<GmailConnector>) -> Self {
        Self { hub }
    }

    async fn get_full_message(&self, id: &str) -> Result<Message> {
        with_retry("messages_get", MAX_RETRIES, || async {
            let call = self
                .hub
                .users()
                .messages_get("me", id)
                .format("full")
                .add_scope(MODIFY_SCOPE)
                .doit();
            let (_, message) = with_timeout("messages_get", call).await??;
            Ok(message)
        })
        .await
    }

    async fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < limit {
            let page_size = (limit - ids.len()).min(100) as u32;
            let token = page_token.clone();
            let response = with_retry("messages_list", MAX_RETRIES, || {
                let token = token.clone();
                async move {
                    let mut call = self
                        .hub
                        .users()
                        .messages_list("me")
                        .q(query)
                        .max_results(page_size);
                    if let Some(token) = token.as_deref() {
                        call = call.page_token(token);
                    }
                    let (_, response) =
                        with_timeout("messages_list", call.add_scope(MODIFY_SCOPE).doit()).await??;
                    Ok(response)
                }
            })
            .await?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(limit);
        Ok(ids)
    }
}

/// Check if an error is retryable
fn should_retry(error: &JanitorError) -> bool {
    error.is_transient()
}

/// Execute an async operation with exponential backoff retry
async fn with_retry<T, F, Fut>(
    operation_name: &str,
    max_retries: u32,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if should_retry(&e) && attempts <= max_retries => {
                let wait = match e {
                    JanitorError::RateLimitExceeded { retry_after } => {
                        Duration::from_secs(retry_after).max(delay)
                    }
                    _ => delay,
                };
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    max_retries + 1,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

async fn with_timeout<T, Fut>(
    operation_name: &str,
    call: Fut,
) -> Result<std::result::Result<T, google_gmail1::Error>>
where
    Fut: Future<Output = std::result::Result<T, google_gmail1::Error>>,
{
    tokio::time::timeout(API_TIMEOUT, call).await.map_err(|_| {
        warn!("Gmail API {} call timed out after {:?}", operation_name, API_TIMEOUT);
        JanitorError::NetworkError(format!("API call timed out after {:?}", API_TIMEOUT))
    })
}

/// Turn a full Gmail message into an [`EmailRecord`]
fn parse_message(msg: Message) -> Result<EmailRecord> {
    let id = msg
        .id
        .ok_or_else(|| JanitorError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let mut record = EmailRecord::new(id, String::new(), String::new());
    record.thread_id = msg.thread_id;
    record.labels = msg.label_ids.unwrap_or_default();
    record.snippet = msg.snippet.filter(|s| !s.is_empty());
    record.received_at = msg.internal_date.and_then(DateTime::from_timestamp_millis);

    if let Some(payload) = msg.payload.as_ref() {
        for header in payload.headers.iter().flatten() {
            if let (Some(name), Some(value)) = (&header.name, &header.value) {
                match name.to_lowercase().as_str() {
                    "from" => record.sender = value.clone(),
                    "to" => record.recipient = Some(value.clone()),
                    "subject" => record.subject = value.clone(),
                    "date" => {
                        if let Ok(date) = parse_date(value) {
                            record.received_at = Some(date);
                        }
                    }
                    _ => {}
                }
            }
        }
        record.body = extract_body(payload);
    }

    Ok(record)
}

/// Parse RFC 2822 date string
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| JanitorError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

/// Plain text wins over HTML anywhere in the MIME tree.
fn extract_body(payload: &MessagePart) -> Option<String> {
    find_part_text(payload, "text/plain").or_else(|| find_part_text(payload, "text/html"))
}

fn find_part_text(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) {
        let text = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_ref())
            .map(|data| String::from_utf8_lossy(data).into_owned())
            .filter(|t| !t.trim().is_empty());
        if text.is_some() {
            return text;
        }
    }

    part.parts
        .iter()
        .flatten()
        .find_map(|child| find_part_text(child, mime_type))
}

#[async_trait]
impl Mailbox for GmailMailbox {
    async fn fetch_unread(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>> {
        let ids = self.list_message_ids(query, limit).await?;
        debug!("Found {} message ids for '{}'", ids.len(), query);

        stream::iter(ids)
            .map(|id| async move { self.get_full_message(&id).await.and_then(parse_message) })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn fetch_body(&self, message_id: &str) -> Result<Option<String>> {
        let message = self.get_full_message(message_id).await?;
        Ok(message.payload.as_ref().and_then(extract_body))
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        with_retry("list_labels", MAX_RETRIES, || async {
            let call = self
                .hub
                .users()
                .labels_list("me")
                .add_scope(LABELS_SCOPE)
                .doit();
            let (_, response) = with_timeout("list_labels", call).await??;

            let labels: Vec<LabelInfo> = response
                .labels
                .unwrap_or_default()
                .into_iter()
                .filter_map(|label| match (label.id, label.name) {
                    (Some(id), Some(name)) => Some(LabelInfo { id, name }),
                    _ => None,
                })
                .collect();

            debug!("Successfully parsed {} labels", labels.len());
            Ok(labels)
        })
        .await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        with_retry("create_label", MAX_RETRIES, || async {
            let label = Label {
                name: Some(name.to_string()),
                message_list_visibility: Some("show".to_string()),
                label_list_visibility: Some("labelShow".to_string()),
                ..Default::default()
            };

            let call = self
                .hub
                .users()
                .labels_create(label, "me")
                .add_scope(LABELS_SCOPE)
                .doit();
            let (_, created) = with_timeout("create_label", call).await??;

            created
                .id
                .ok_or_else(|| JanitorError::LabelError("Created label has no ID".to_string()))
        })
        .await
    }

    async fn modify_labels(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        with_retry("modify_labels", MAX_RETRIES, || async {
            let request = ModifyMessageRequest {
                add_label_ids: (!add_label_ids.is_empty()).then(|| add_label_ids.to_vec()),
                remove_label_ids: (!remove_label_ids.is_empty()).then(|| remove_label_ids.to_vec()),
            };

            let call = self
                .hub
                .users()
                .messages_modify(request, "me", message_id)
                .add_scope(MODIFY_SCOPE)
                .doit();
            with_timeout("modify_labels", call).await??;
            Ok(())
        })
        .await
    }
}
