//! Email Janitor
//!
//! Classifies unread Gmail one message at a time with a language model,
//! files each message under a category label, and learns from reviewer
//! corrections by feeding them back to the model as few-shot examples.
//!
//! # Overview
//!
//! - **Collection**: unread mail not yet carrying the processed label
//! - **Classification loop**: one model call per email, checkpointed after
//!   every result so an interrupted run resumes without duplicates
//! - **Corrections**: past human corrections ranked by sender relevance and
//!   injected into the prompt
//! - **Labelling**: category label plus processed label, archiving the
//!   categories that do not belong in the inbox
//! - **History**: runs, classifications and corrections in SQLite
//!   (feature `history`)
//!
//! # Example Usage
//!
//! ```no_run
//! use email_janitor::config::ClassifierConfig;
//! use email_janitor::coordinator::{ClassificationCoordinator, NoBodySource};
//! use email_janitor::model::OpenAiClassifier;
//! use email_janitor::models::{EmailBatch, EmailRecord};
//! use email_janitor::state::{MemoryStateStore, RunState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClassifierConfig::default();
//!     let coordinator =
//!         ClassificationCoordinator::new(OpenAiClassifier::from_config(&config), config);
//!
//!     let batch = EmailBatch::new(vec![EmailRecord::new("m1", "boss@work.com", "Need this today")]);
//!     let mut state = RunState::with_batch(batch);
//!     let store = MemoryStateStore::new();
//!
//!     let collection = coordinator
//!         .run_to_completion(&mut state, &store, &NoBodySource, |_| {})
//!         .await?;
//!     println!("{} classified", collection.count);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`coordinator`] - The per-email classification loop
//! - [`accumulator`] - Recording one result into the run state
//! - [`instructions`] - Prompt construction
//! - [`parser`] - Tolerant parsing of model output
//! - [`relevance`] - Choosing which corrections to show the model
//! - [`state`] - Run state and its stores
//! - [`mailbox`] / [`gmail`] - Mailbox seam and its Gmail implementation
//! - [`labeler`] - Applying category labels
//! - [`cli`] - Command-line interface and run orchestration
//!
//! # Features
//!
//! - `ml` (default): [`model::OpenAiClassifier`] for OpenAI-compatible endpoints
//! - `history` (default): the SQLite history store. Corrections recorded
//!   with `email-janitor correct` only reach the prompt when this is on, and
//!   the `history`, `review`, `correct` and `corrections` subcommands exist
//!   only with it

pub mod accumulator;
pub mod auth;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gmail;
#[cfg(feature = "history")]
pub mod history;
pub mod instructions;
pub mod labeler;
pub mod mailbox;
pub mod model;
pub mod models;
pub mod parser;
pub mod relevance;
pub mod state;

pub use config::Config;
pub use coordinator::{ClassificationCoordinator, StepOutcome};
pub use error::{JanitorError, Result};
pub use mailbox::Mailbox;
pub use model::ClassifierModel;
pub use models::{
    ClassificationCollection, ClassificationResult, CorrectionRecord, EmailBatch, EmailCategory,
    EmailRecord,
};
pub use state::{RunState, StateStore};
