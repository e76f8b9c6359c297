//! Mailbox seam used by the collector, the body lookup and the labeler.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::models::{truncate_chars, EmailBatch, EmailRecord};

/// Label info returned from the mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

/// System label id that keeps a message in the inbox
pub const INBOX_LABEL_ID: &str = "INBOX";

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Messages matching `query`, newest first, at most `limit`
    async fn fetch_unread(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>>;

    /// Full plain-text body of a message, if it has one
    async fn fetch_body(&self, message_id: &str) -> Result<Option<String>>;

    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// Create a user label and return its id
    async fn create_label(&self, name: &str) -> Result<String>;

    async fn modify_labels(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()>;
}

#[async_trait]
impl<T: Mailbox + ?Sized> Mailbox for std::sync::Arc<T> {
    async fn fetch_unread(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>> {
        (**self).fetch_unread(query, limit).await
    }

    async fn fetch_body(&self, message_id: &str) -> Result<Option<String>> {
        (**self).fetch_body(message_id).await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        (**self).list_labels().await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        (**self).create_label(name).await
    }

    async fn modify_labels(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        (**self)
            .modify_labels(message_id, add_label_ids, remove_label_ids)
            .await
    }
}

/// Gmail search for unread mail that has not been handled yet.
pub fn unread_query(inbox_query: &str, processed_label: &str) -> String {
    let base = inbox_query.trim();
    let exclusion = format!("-label:{}", processed_label.trim());
    if base.is_empty() {
        format!("is:unread {}", exclusion)
    } else {
        format!("{} is:unread {}", base, exclusion)
    }
}

/// Collect the batch for one run.
///
/// Bodies are cut to `body_char_limit` characters before they enter run state.
pub async fn collect_batch(
    mailbox: &dyn Mailbox,
    inbox_query: &str,
    processed_label: &str,
    limit: usize,
    body_char_limit: usize,
) -> Result<EmailBatch> {
    let query = unread_query(inbox_query, processed_label);
    let mut emails = mailbox.fetch_unread(&query, limit).await?;
    for email in &mut emails {
        if let Some(body) = email.body.as_mut() {
            if body.chars().nth(body_char_limit).is_some() {
                *body = truncate_chars(body, body_char_limit);
            }
        }
    }
    info!("Collected {} unread emails with query '{}'", emails.len(), query);
    Ok(EmailBatch::new(emails))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_query_appends_exclusion() {
        assert_eq!(
            unread_query("in:inbox -in:sent", "janitor/done"),
            "in:inbox -in:sent is:unread -label:janitor/done"
        );
        assert_eq!(unread_query("  ", "done"), "is:unread -label:done");
    }
}
