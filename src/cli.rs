//! Command-line interface and run orchestration

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::ClassificationCoordinator;
use crate::error::{JanitorError, Result};
use crate::labeler::Labeler;
use crate::mailbox::{collect_batch, Mailbox};
use crate::model::ClassifierModel;
use crate::models::{ClassificationResult, CorrectionRecord, EmailCategory, ProcessingSummary};
use crate::state::{resume_or_new, JsonStateFile, StateStore};

#[derive(Parser, Debug)]
#[command(name = "email-janitor")]
#[command(version)]
#[command(about = "Classifies unread Gmail with a language model and files it away", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Classify and label unread email, polling until interrupted
    Run {
        /// Process one batch and exit
        #[arg(long)]
        once: bool,

        /// Classify but don't touch the mailbox or the history database
        #[arg(long)]
        dry_run: bool,

        /// Resume from previous interrupted run
        #[arg(long)]
        resume: bool,
    },

    /// Show the state of the current or last run
    Status,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// List past runs
    #[cfg(feature = "history")]
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// List stored classifications for review
    #[cfg(feature = "history")]
    Review {
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, value_parser = parse_category)]
        category: Option<EmailCategory>,

        /// Only show results at or below this confidence
        #[arg(long)]
        max_confidence: Option<f64>,

        /// Skip classifications that already have a correction
        #[arg(long)]
        hide_corrected: bool,

        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },

    /// Correct a stored classification; used as an example in later runs
    #[cfg(feature = "history")]
    Correct {
        /// Classification id as shown by `review`
        id: i64,

        #[arg(value_parser = parse_category)]
        category: EmailCategory,

        /// Why the original was wrong
        #[arg(long)]
        note: Option<String>,
    },

    /// Show correction statistics
    #[cfg(feature = "history")]
    Corrections,
}

/// Case-insensitive category argument
pub fn parse_category(value: &str) -> std::result::Result<EmailCategory, String> {
    value
        .trim()
        .to_uppercase()
        .parse()
        .map_err(|_| {
            let names: Vec<&str> = EmailCategory::ALL.iter().map(|c| c.as_str()).collect();
            format!("expected one of {}", names.join(", "))
        })
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above the bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one run, printed and saved as Markdown
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub emails_collected: usize,
    pub emails_classified: usize,
    pub confidence_threshold: f64,
    /// Classifications below the confidence threshold
    pub needs_review: Vec<ClassificationResult>,
    pub category_counts: BTreeMap<EmailCategory, usize>,
    pub labelling: ProcessingSummary,
    pub halted_by_ceiling: bool,
    pub dry_run: bool,
}

impl RunReport {
    pub fn low_confidence(&self) -> usize {
        self.needs_review.len()
    }

    pub fn emails_labelled(&self) -> usize {
        self.labelling.total_processed - self.labelling.errors_count
    }

    /// Status recorded in the history database
    pub fn status(&self) -> &'static str {
        if self.dry_run {
            "dry_run"
        } else if self.halted_by_ceiling {
            "partial"
        } else if self.labelling.errors_count > 0 {
            "completed_with_errors"
        } else {
            "completed"
        }
    }

    /// Generate Markdown report
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        if self.dry_run {
            md.push_str("# Email Janitor Report (DRY RUN)\n\n");
            md.push_str("> **DRY RUN MODE** - No labels were changed. This report shows what WOULD happen.\n\n");
        } else {
            md.push_str("# Email Janitor Report\n\n");
        }
        md.push_str(&format!(
            "Generated: {}\n\n",
            self.completed_at.format("%Y-%m-%d %H:%M:%S")
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Run ID:** {}\n", self.run_id));
        md.push_str(&format!("- **Model:** {}\n", self.model));
        md.push_str(&format!("- **Emails collected:** {}\n", self.emails_collected));
        md.push_str(&format!("- **Emails classified:** {}\n", self.emails_classified));
        md.push_str(&format!(
            "- **Low confidence (< {:.1}):** {}\n",
            self.confidence_threshold,
            self.low_confidence()
        ));
        md.push_str(&format!("- **Emails labelled:** {}\n", self.emails_labelled()));
        md.push_str(&format!("- **Errors:** {}\n", self.labelling.errors_count));
        md.push_str(&format!(
            "- **Processing time:** {} minutes {} seconds\n",
            self.duration_seconds / 60,
            self.duration_seconds % 60
        ));
        if self.halted_by_ceiling {
            md.push_str(&format!(
                "- **Stopped early:** iteration ceiling reached, {} emails left for the next run\n",
                self.emails_collected.saturating_sub(self.emails_classified)
            ));
        }
        md.push('\n');

        md.push_str("## Categories\n\n");
        if self.category_counts.is_empty() {
            md.push_str("_No emails were classified._\n\n");
        } else {
            md.push_str("| Category | Emails | Share |\n");
            md.push_str("|----------|--------|-------|\n");
            let total = self.emails_classified.max(1) as f64;
            for (category, count) in &self.category_counts {
                md.push_str(&format!(
                    "| {} | {} | {:.1}% |\n",
                    category,
                    count,
                    *count as f64 / total * 100.0
                ));
            }
            md.push('\n');
        }

        if !self.labelling.label_counts.is_empty() {
            md.push_str(if self.dry_run { "## Labels To Apply\n\n" } else { "## Labels Applied\n\n" });
            for (label, count) in &self.labelling.label_counts {
                md.push_str(&format!("- `{}`: {}\n", label, count));
            }
            md.push('\n');
        }

        if !self.needs_review.is_empty() {
            md.push_str("## Needs Review\n\n");
            md.push_str("| Sender | Subject | Category | Confidence | Reasoning |\n");
            md.push_str("|--------|---------|----------|------------|-----------|\n");
            for result in &self.needs_review {
                md.push_str(&format!(
                    "| {} | {} | {} | {:.1} | {} |\n",
                    escape_cell(&truncate_string(&result.sender, 40)),
                    escape_cell(&truncate_string(&result.subject, 60)),
                    result.category,
                    result.confidence,
                    escape_cell(&truncate_string(&result.reasoning, 80)),
                ));
            }
            md.push('\n');
        }

        let errors: Vec<_> = self.labelling.errors().collect();
        if !errors.is_empty() {
            md.push_str("## Errors\n\n");
            for failed in errors {
                md.push_str(&format!(
                    "- `{}`: {}\n",
                    failed.email_id,
                    failed.error.as_deref().unwrap_or("unknown error")
                ));
            }
            md.push('\n');
        }

        if self.dry_run {
            md.push_str("---\n\n");
            md.push_str("_To apply these labels, run the command again without the `--dry-run` flag._\n");
        }

        md
    }

    /// Save report to file
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, self.to_markdown()).await
    }

    #[cfg(feature = "history")]
    pub fn to_run_record(&self) -> crate::history::RunRecord {
        crate::history::RunRecord {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: self.completed_at,
            emails_collected: self.emails_collected,
            emails_classified: self.emails_classified,
            emails_labelled: self.emails_labelled(),
            errors_count: self.labelling.errors_count,
            status: self.status().to_string(),
        }
    }
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub resume: bool,
}

/// Build the configured language model client
#[cfg(feature = "ml")]
pub fn build_model(config: &Config) -> Result<Arc<dyn ClassifierModel>> {
    let model = crate::model::OpenAiClassifier::from_config(&config.classifier);
    info!(
        "Using model {} at {}",
        config.classifier.model, config.classifier.api_base
    );
    Ok(Arc::new(model))
}

#[cfg(not(feature = "ml"))]
pub fn build_model(_config: &Config) -> Result<Arc<dyn ClassifierModel>> {
    Err(JanitorError::ConfigError(
        "email-janitor was built without the `ml` feature; no model client is available"
            .to_string(),
    ))
}

/// Past corrections to draw few-shot examples from. Never fails the run.
#[cfg(feature = "history")]
fn load_corrections(config: &Config) -> Vec<CorrectionRecord> {
    let loaded = crate::history::HistoryStore::open(&config.database.path)
        .and_then(|store| store.corrections_for_few_shot(config.classifier.correction_pool));
    match loaded {
        Ok(corrections) => {
            info!("Loaded {} past corrections", corrections.len());
            corrections
        }
        Err(e) => {
            warn!("Could not load corrections, classifying without examples: {}", e);
            Vec::new()
        }
    }
}

#[cfg(not(feature = "history"))]
fn load_corrections(_config: &Config) -> Vec<CorrectionRecord> {
    Vec::new()
}

#[cfg(feature = "history")]
fn persist_history(
    config: &Config,
    report: &RunReport,
    collection: &crate::models::ClassificationCollection,
) {
    let persisted = crate::history::HistoryStore::open(&config.database.path).and_then(|mut store| {
        store.persist_run(&report.to_run_record(), collection, &report.labelling)
    });
    if let Err(e) = persisted {
        warn!("Failed to record run {} in history: {}", report.run_id, e);
    }
}

/// Run one batch end to end: collect, classify, label, record.
///
/// The run state is checkpointed to `config.app.state_file` after every
/// email and removed once the run has been labelled.
pub async fn run_pipeline<B, M>(
    config: &Config,
    mailbox: &B,
    model: M,
    options: RunOptions,
    reporter: &ProgressReporter,
) -> Result<RunReport>
where
    B: Mailbox,
    M: ClassifierModel,
{
    let started_at = Utc::now();
    let store = JsonStateFile::new(&config.app.state_file);
    let mut state = resume_or_new(&store, options.resume).await?;
    info!("Starting run {}", state.run_id);

    if state.batch.is_none() {
        let spinner = reporter.add_spinner("Collecting unread emails...");
        let batch = collect_batch(
            mailbox,
            &config.gmail.inbox_query,
            &config.gmail.processed_label,
            config.classifier.max_iterations,
            config.classifier.body_char_limit,
        )
        .await;
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                spinner.finish_and_clear();
                return Err(e);
            }
        };
        reporter.finish_spinner(&spinner, &format!("Collected {} unread emails", batch.count));
        state.batch = Some(batch);
    }
    let emails_collected = state.batch.as_ref().map(|b| b.count).unwrap_or(0);

    let corrections = load_corrections(config);
    let coordinator =
        ClassificationCoordinator::new(model, config.classifier.clone()).with_corrections(corrections);
    let model_name = coordinator.model().name().to_string();

    let bar = reporter.add_progress_bar(emails_collected as u64, "Classifying...");
    bar.set_position(state.collection.count as u64);
    let collection = coordinator
        .run_to_completion(&mut state, &store, mailbox, |result| {
            bar.set_message(truncate_string(&result.subject, 40));
            bar.inc(1);
        })
        .await;
    let collection = match collection {
        Ok(collection) => collection,
        Err(e) => {
            bar.abandon_with_message("Classification stopped");
            return Err(e);
        }
    };
    bar.finish_with_message(format!("Classified {} emails", collection.count));

    let spinner = reporter.add_spinner(if options.dry_run {
        "Planning labels..."
    } else {
        "Applying labels..."
    });
    let labelling = Labeler::new(mailbox, config.gmail.clone())
        .dry_run(options.dry_run)
        .apply(&collection)
        .await;
    reporter.finish_spinner(
        &spinner,
        &format!(
            "{} {} emails ({} errors)",
            if options.dry_run { "Planned" } else { "Labelled" },
            labelling.total_processed - labelling.errors_count,
            labelling.errors_count
        ),
    );

    let completed_at = Utc::now();
    let threshold = config.classifier.confidence_threshold;
    let report = RunReport {
        run_id: state.run_id.clone(),
        model: model_name,
        started_at,
        completed_at,
        duration_seconds: (completed_at - started_at).num_seconds(),
        emails_collected,
        emails_classified: collection.count,
        confidence_threshold: threshold,
        needs_review: collection.low_confidence(threshold),
        category_counts: collection.category_counts(),
        labelling,
        halted_by_ceiling: state.halted_by_ceiling,
        dry_run: options.dry_run,
    };

    #[cfg(feature = "history")]
    if !options.dry_run {
        persist_history(config, &report, &collection);
    }

    let report_path = config
        .app
        .state_file
        .with_file_name(format!("report-{}.md", report.run_id));
    match report.save(&report_path).await {
        Ok(()) => info!("Report saved to {:?}", report_path),
        Err(e) => warn!("Failed to save report to {:?}: {}", report_path, e),
    }

    store.clear().await?;
    Ok(report)
}

/// Whether the poll loop should give up after this error
pub fn is_fatal(error: &JanitorError) -> bool {
    matches!(
        error,
        JanitorError::AuthError(_) | JanitorError::ConfigError(_) | JanitorError::Forbidden(_)
    ) || error.is_fatal_for_run()
}
