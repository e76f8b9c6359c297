//! SQLite history of runs, classifications and human corrections.
//!
//! The corrections table feeds the few-shot examples of later runs.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{JanitorError, Result};
use crate::models::{
    ClassificationCollection, CorrectionRecord, EmailCategory, ProcessingSummary,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    emails_collected INTEGER NOT NULL,
    emails_classified INTEGER NOT NULL,
    emails_labelled INTEGER NOT NULL,
    errors_count INTEGER NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS classifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    email_id TEXT NOT NULL,
    sender TEXT,
    subject TEXT,
    classification TEXT NOT NULL,
    reasoning TEXT,
    confidence REAL,
    refinement_count INTEGER,
    action TEXT,
    status TEXT,
    classified_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS corrections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    classification_id INTEGER REFERENCES classifications(id),
    run_id TEXT REFERENCES runs(run_id),
    email_id TEXT,
    original_classification TEXT,
    corrected_classification TEXT,
    corrected_by TEXT,
    corrected_at TEXT,
    notes TEXT
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of the `runs` table
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub emails_collected: usize,
    pub emails_classified: usize,
    pub emails_labelled: usize,
    pub errors_count: usize,
    pub status: String,
}

/// A stored classification joined with its latest correction, if any
#[derive(Debug, Clone, PartialEq)]
pub struct StoredClassification {
    pub id: i64,
    pub run_id: String,
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub classification: String,
    pub reasoning: String,
    pub confidence: Option<f64>,
    pub action: Option<String>,
    pub status: Option<String>,
    pub classified_at: DateTime<Utc>,
    pub corrected_classification: Option<String>,
    pub correction_notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationFilter {
    pub run_id: Option<String>,
    pub category: Option<EmailCategory>,
    pub max_confidence: Option<f64>,
    pub hide_corrected: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionStats {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
}

pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Open (or create) the database and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Opened history database {:?} (journal_mode={})", path, mode);
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Write the run row and one row per classification in a single transaction.
    pub fn persist_run(
        &mut self,
        run: &RunRecord,
        collection: &ClassificationCollection,
        summary: &ProcessingSummary,
    ) -> Result<()> {
        let outcomes: HashMap<&str, _> = summary
            .results
            .iter()
            .map(|r| (r.email_id.as_str(), r))
            .collect();
        let finished_at = timestamp(&run.finished_at);

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO runs
                (run_id, started_at, finished_at, emails_collected,
                 emails_classified, emails_labelled, errors_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_id,
                timestamp(&run.started_at),
                finished_at,
                run.emails_collected as i64,
                run.emails_classified as i64,
                run.emails_labelled as i64,
                run.errors_count as i64,
                run.status,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO classifications
                    (run_id, email_id, sender, subject, classification, reasoning,
                     confidence, refinement_count, action, status, classified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for result in &collection.classifications {
                let outcome = outcomes.get(result.email_id.as_str());
                stmt.execute(params![
                    run.run_id,
                    result.email_id,
                    result.sender,
                    result.subject,
                    result.category.as_str(),
                    result.reasoning,
                    result.confidence,
                    result.refinement_count,
                    outcome.map(|o| o.action()),
                    outcome.map(|o| o.status.as_str()),
                    finished_at,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            "Persisted run {} with {} classifications",
            run.run_id, collection.count
        );
        Ok(())
    }

    /// Most recent corrections with the sender and subject of the corrected email
    pub fn corrections_for_few_shot(&self, limit: usize) -> Result<Vec<CorrectionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.sender, c.subject, cr.original_classification,
                    cr.corrected_classification, cr.notes, cr.corrected_at
             FROM corrections cr
             JOIN classifications c ON c.id = cr.classification_id
             ORDER BY cr.corrected_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(CorrectionRecord {
                sender: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                subject: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                original_classification: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                corrected_classification: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                note: row.get::<_, Option<String>>(4)?.filter(|n| !n.trim().is_empty()),
                corrected_at: parse_timestamp(row.get::<_, Option<String>>(5)?.as_deref()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Record a reviewer's correction of a stored classification; returns the correction id.
    pub fn insert_correction(
        &self,
        classification_id: i64,
        corrected: EmailCategory,
        corrected_by: &str,
        notes: Option<&str>,
    ) -> Result<i64> {
        let original: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT run_id, email_id, classification FROM classifications WHERE id = ?1",
                [classification_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (run_id, email_id, original_classification) =
            original.ok_or(JanitorError::ClassificationNotFound(classification_id))?;

        self.conn.execute(
            "INSERT INTO corrections
                (classification_id, run_id, email_id, original_classification,
                 corrected_classification, corrected_by, corrected_at, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                classification_id,
                run_id,
                email_id,
                original_classification,
                corrected.as_str(),
                corrected_by,
                timestamp(&Utc::now()),
                notes.unwrap_or(""),
            ],
        )?;
        info!(
            "Recorded correction for classification {}: {} -> {}",
            classification_id, original_classification, corrected
        );
        Ok(self.conn.last_insert_rowid())
    }

    /// Stored classifications, newest first, each with its latest correction
    pub fn list_classifications(
        &self,
        filter: &ClassificationFilter,
    ) -> Result<Vec<StoredClassification>> {
        let mut query = String::from(
            "SELECT c.id, c.run_id, c.email_id, c.sender, c.subject, c.classification,
                    c.reasoning, c.confidence, c.action, c.status, c.classified_at,
                    cr.corrected_classification, cr.notes
             FROM classifications c
             LEFT JOIN (
                 SELECT *, ROW_NUMBER() OVER (
                     PARTITION BY classification_id ORDER BY corrected_at DESC
                 ) AS rn
                 FROM corrections
             ) cr ON cr.classification_id = c.id AND cr.rn = 1
             WHERE 1=1",
        );
        let category = filter.category.map(|c| c.as_str());
        let mut args: Vec<&dyn ToSql> = Vec::new();

        if let Some(run_id) = &filter.run_id {
            query.push_str(" AND c.run_id = ?");
            args.push(run_id);
        }
        if let Some(category) = &category {
            query.push_str(" AND c.classification = ?");
            args.push(category);
        }
        if let Some(max) = &filter.max_confidence {
            query.push_str(" AND c.confidence <= ?");
            args.push(max);
        }
        if filter.hide_corrected {
            query.push_str(" AND cr.corrected_classification IS NULL");
        }
        query.push_str(" ORDER BY c.classified_at DESC, c.id DESC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(args.as_slice(), |row| {
            Ok(StoredClassification {
                id: row.get(0)?,
                run_id: row.get(1)?,
                email_id: row.get(2)?,
                sender: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                subject: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                classification: row.get(5)?,
                reasoning: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                confidence: row.get(7)?,
                action: row.get(8)?,
                status: row.get(9)?,
                classified_at: parse_timestamp(row.get::<_, Option<String>>(10)?.as_deref()),
                corrected_classification: row.get(11)?,
                correction_notes: row.get::<_, Option<String>>(12)?.filter(|n| !n.is_empty()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All runs, most recent first
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, started_at, finished_at, emails_collected, emails_classified,
                    emails_labelled, errors_count, status
             FROM runs ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RunRecord {
                run_id: row.get(0)?,
                started_at: parse_timestamp(row.get::<_, Option<String>>(1)?.as_deref()),
                finished_at: parse_timestamp(row.get::<_, Option<String>>(2)?.as_deref()),
                emails_collected: row.get::<_, i64>(3)? as usize,
                emails_classified: row.get::<_, i64>(4)? as usize,
                emails_labelled: row.get::<_, i64>(5)? as usize,
                errors_count: row.get::<_, i64>(6)? as usize,
                status: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn correction_stats(&self) -> Result<CorrectionStats> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM corrections", [], |row| row.get(0))?;
        let mut stmt = self.conn.prepare(
            "SELECT corrected_classification, COUNT(*) FROM corrections
             GROUP BY corrected_classification",
        )?;
        let mut by_category = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                row.get::<_, i64>(1)?,
            ))
        })?;
        for row in rows {
            let (category, count) = row?;
            by_category.insert(category, count as usize);
        }
        Ok(CorrectionStats {
            total: total as usize,
            by_category,
        })
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Timestamps are RFC 3339 text; unreadable ones sort as the epoch.
fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
