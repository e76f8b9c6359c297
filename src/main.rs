use anyhow::Result;
use clap::Parser;
use email_janitor::cli::{self, Cli, Commands, LogFormat, ProgressReporter, RunOptions, RunReport};
use email_janitor::config::Config;
use email_janitor::error::JanitorError;
use email_janitor::gmail::{GmailMailbox, MODIFY_SCOPE};
use email_janitor::state::{JsonStateFile, StateStore};
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut buffer) = self.buffer.lock() {
            if !buffer.is_empty() {
                let msg = String::from_utf8_lossy(&buffer);
                let msg = msg.trim_end_matches('\n');
                if !msg.is_empty() {
                    let _ = self.multi.println(msg);
                }
                buffer.clear();
            }
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

fn init_tracing(cli: &Cli, multi: &Arc<MultiProgress>) {
    let default_directive = if cli.verbose {
        "email_janitor=debug,info"
    } else {
        "email_janitor=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let make_writer = MultiProgressMakeWriter {
        multi: Arc::clone(multi),
    };

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .with_current_span(false)
            .init(),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: email-janitor --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // aws-lc-rs everywhere except Windows, where ring avoids the NASM/CMake toolchain
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, &multi_progress);

    match cli.command {
        Commands::Auth { force } => {
            let config = Config::load_with_env(&cli.config).await?;
            let token_cache = &config.gmail.token_cache_path;

            if force && token_cache.exists() {
                tokio::fs::remove_file(token_cache).await?;
                tracing::info!("Removed existing token cache");
            }

            let hub = email_janitor::auth::initialize_gmail_hub(
                &config.gmail.credentials_path,
                token_cache,
            )
            .await?;

            println!("Successfully authenticated with Gmail API");
            println!("Token cached at: {:?}", token_cache);

            // Same scope as the cached token, otherwise a second consent flow starts
            let (_, profile) = hub
                .users()
                .get_profile("me")
                .add_scope(MODIFY_SCOPE)
                .doit()
                .await
                .map_err(JanitorError::from)?;
            println!(
                "Connected to account: {}",
                profile.email_address.unwrap_or_default()
            );

            Ok(())
        }

        Commands::Run {
            once,
            dry_run,
            resume,
        } => {
            let config = Config::load_with_env(&cli.config).await?;
            if dry_run {
                println!("Running in DRY RUN mode - no labels will be changed");
            }

            let hub = email_janitor::auth::initialize_gmail_hub(
                &config.gmail.credentials_path,
                &config.gmail.token_cache_path,
            )
            .await?;
            let mailbox = GmailMailbox::new(hub);
            let model = cli::build_model(&config)?;
            let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());
            let poll_interval = Duration::from_secs(config.app.poll_interval_secs);

            let mut resume = resume;
            loop {
                let options = RunOptions { dry_run, resume };
                match cli::run_pipeline(&config, &mailbox, model.clone(), options, &reporter).await
                {
                    Ok(report) => print_summary(&report),
                    Err(e) if once || cli::is_fatal(&e) => return Err(e.into()),
                    Err(e) => tracing::error!("Run failed, retrying next cycle: {}", e),
                }
                // Anything left behind by a failed run is picked up next cycle
                resume = true;

                if once {
                    break;
                }

                tracing::info!("Sleeping {}s until next run", poll_interval.as_secs());
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted, shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            Ok(())
        }

        Commands::Status => {
            let config = Config::load_with_env(&cli.config).await?;
            let store = JsonStateFile::new(&config.app.state_file);

            match store.load().await? {
                Some(state) => {
                    println!("\n========================================");
                    println!("Run State");
                    println!("========================================");
                    println!("Run ID: {}", state.run_id);
                    println!("Started: {}", state.started_at.format("%Y-%m-%d %H:%M:%S"));
                    println!("Updated: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));
                    println!("Phase: {:?}", state.phase);
                    if let Some(batch) = &state.batch {
                        println!("Emails collected: {}", batch.count);
                    }
                    if let Some(cursor) = &state.cursor {
                        println!(
                            "Progress: {}/{} ({:.0}%)",
                            cursor.index,
                            cursor.total,
                            state.progress_percent()
                        );
                    }
                    println!("Classified: {}", state.collection.count);
                    println!("Model calls: {}", state.iterations);
                    if state.halted_by_ceiling {
                        println!("Stopped at the iteration ceiling");
                    }
                    if state.can_resume() {
                        println!("\nResume with: email-janitor run --resume");
                    }
                    println!("========================================");
                }
                None => {
                    println!("No active or interrupted run.");
                    println!("State file: {:?}", store.path());
                }
            }

            Ok(())
        }

        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(JanitorError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - classifier.model / classifier.api_base: which model to call");
            println!("  - classifier.max_iterations: ceiling on model calls per run");
            println!("  - gmail.inbox_query: which mail is considered");
            println!("  - gmail.*_label: label applied per category");

            Ok(())
        }

        #[cfg(feature = "history")]
        Commands::History { limit } => {
            let config = Config::load_with_env(&cli.config).await?;
            let store = email_janitor::history::HistoryStore::open(&config.database.path)?;
            let runs = store.list_runs()?;
            if runs.is_empty() {
                println!("No runs recorded in {:?}", config.database.path);
                return Ok(());
            }
            println!(
                "{:<38} {:<17} {:>9} {:>10} {:>8} {:>6}  STATUS",
                "RUN", "STARTED", "COLLECTED", "CLASSIFIED", "LABELLED", "ERRORS"
            );
            for run in runs.iter().take(limit) {
                println!(
                    "{:<38} {:<17} {:>9} {:>10} {:>8} {:>6}  {}",
                    run.run_id,
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.emails_collected,
                    run.emails_classified,
                    run.emails_labelled,
                    run.errors_count,
                    run.status
                );
            }
            Ok(())
        }

        #[cfg(feature = "history")]
        Commands::Review {
            run_id,
            category,
            max_confidence,
            hide_corrected,
            limit,
        } => {
            let config = Config::load_with_env(&cli.config).await?;
            let store = email_janitor::history::HistoryStore::open(&config.database.path)?;
            let filter = email_janitor::history::ClassificationFilter {
                run_id,
                category,
                max_confidence,
                hide_corrected,
            };
            let rows = store.list_classifications(&filter)?;
            if rows.is_empty() {
                println!("No classifications match.");
                return Ok(());
            }
            for row in rows.iter().take(limit) {
                let corrected = row
                    .corrected_classification
                    .as_deref()
                    .map(|c| format!(" -> {}", c))
                    .unwrap_or_default();
                println!(
                    "#{:<6} {:<13}{} ({}) {}",
                    row.id,
                    row.classification,
                    corrected,
                    row.confidence
                        .map(|c| format!("{:.1}", c))
                        .unwrap_or_else(|| "-".to_string()),
                    row.classified_at.format("%Y-%m-%d %H:%M")
                );
                println!("        From:    {}", row.sender);
                println!("        Subject: {}", row.subject);
                println!("        Why:     {}", row.reasoning);
                if let Some(notes) = &row.correction_notes {
                    println!("        Note:    {}", notes);
                }
            }
            if rows.len() > limit {
                println!("\n... {} more, raise --limit to see them", rows.len() - limit);
            }
            println!("\nCorrect one with: email-janitor correct <ID> <CATEGORY> --note \"...\"");
            Ok(())
        }

        #[cfg(feature = "history")]
        Commands::Correct { id, category, note } => {
            let config = Config::load_with_env(&cli.config).await?;
            let store = email_janitor::history::HistoryStore::open(&config.database.path)?;
            store.insert_correction(id, category, "user", note.as_deref())?;
            println!("Recorded: classification #{} is {}", id, category);
            Ok(())
        }

        #[cfg(feature = "history")]
        Commands::Corrections => {
            let config = Config::load_with_env(&cli.config).await?;
            let store = email_janitor::history::HistoryStore::open(&config.database.path)?;
            let stats = store.correction_stats()?;
            println!("Total corrections: {}", stats.total);
            for (category, count) in &stats.by_category {
                println!("  {:<14} {}", category, count);
            }
            Ok(())
        }
    }
}

fn print_summary(report: &RunReport) {
    println!("\n========================================");
    println!("Run Summary{}", if report.dry_run { " (DRY RUN)" } else { "" });
    println!("========================================");
    println!("Run ID: {}", report.run_id);
    println!("Duration: {} seconds", report.duration_seconds);
    println!("Emails collected: {}", report.emails_collected);
    println!("Emails classified: {}", report.emails_classified);
    println!(
        "Low confidence (< {:.1}): {}",
        report.confidence_threshold,
        report.low_confidence()
    );
    println!("Emails labelled: {}", report.emails_labelled());
    println!("Errors: {}", report.labelling.errors_count);
    for (label, count) in &report.labelling.label_counts {
        println!("  {}: {}", label, count);
    }
    if report.halted_by_ceiling {
        println!("Stopped at the iteration ceiling; the rest is handled next run");
    }
    println!("========================================");
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(janitor_err) = error.downcast_ref::<JanitorError>() {
        match janitor_err {
            JanitorError::AuthError(_) => {
                eprintln!("\nHint: Make sure your credentials.json file is valid.");
                eprintln!("      You can download it from Google Cloud Console.");
                eprintln!("      Try running: email-janitor auth --force");
            }
            JanitorError::RateLimitExceeded { .. } => {
                eprintln!("\nHint: You've hit Gmail API rate limits.");
                eprintln!("      Wait a minute and try again.");
            }
            JanitorError::ModelError(_) => {
                eprintln!("\nHint: Check that the model endpoint in [classifier] is reachable.");
            }
            JanitorError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: email-janitor init-config --force");
            }
            JanitorError::StateError(_) => {
                eprintln!("\nHint: The run state file may be damaged.");
                eprintln!("      Remove it to start a fresh run.");
            }
            _ => {}
        }
    }
}
