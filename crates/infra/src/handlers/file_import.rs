//! B3 instrument import.
//!
//! The [`InstrumentSource`] is read once per attempt into a ticker-ordered
//! [`InstrumentFile`]; rows it could not parse are counted as failed. The
//! list is then upserted into the [`SecurityCatalog`] one batch at a time,
//! keyed by the upper-cased ticker. After each committed batch the per-job
//! checkpoint advances, so a redelivered job resumes where the previous
//! attempt stopped instead of re-applying earlier batches.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use corejobs_core::JobId;

use super::{JobContext, JobHandler, TaskError};

/// Audit tag recorded on securities created by the import.
pub const IMPORT_ACTOR: &str = "system|b3-import";

/// How long an untouched checkpoint is kept for redeliveries.
pub const DEFAULT_CHECKPOINT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// One row of the instrument file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Instrument {
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ISIN", default)]
    pub isin: Option<String>,
    #[serde(rename = "SecurityTypeId", default)]
    pub security_type_id: i32,
    #[serde(rename = "Currency", default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "BRL".to_string()
}

impl Instrument {
    pub fn new(ticker: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            name: name.into(),
            isin: None,
            security_type_id: 0,
            currency: default_currency(),
        }
    }
}

/// Parsed instrument list, sorted by ticker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentFile {
    pub instruments: Vec<Instrument>,
    /// Rows that could not be parsed.
    pub rejected: u64,
}

impl InstrumentFile {
    pub fn new(mut instruments: Vec<Instrument>, rejected: u64) -> Self {
        instruments.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Self { instruments, rejected }
    }
}

/// Where instruments come from.
#[async_trait::async_trait]
pub trait InstrumentSource: Send + Sync {
    /// Read the full instrument list.
    async fn load(&self) -> Result<InstrumentFile, TaskError>;
}

/// Fixed list of instruments (tests, local runs without a file).
#[derive(Debug, Clone, Default)]
pub struct StaticInstrumentSource {
    file: InstrumentFile,
}

impl StaticInstrumentSource {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            file: InstrumentFile::new(instruments, 0),
        }
    }
}

#[async_trait::async_trait]
impl InstrumentSource for StaticInstrumentSource {
    async fn load(&self) -> Result<InstrumentFile, TaskError> {
        Ok(self.file.clone())
    }
}

/// CSV file with a header row: `Ticker,Name,ISIN,SecurityTypeId,Currency`.
#[derive(Debug, Clone)]
pub struct CsvInstrumentSource {
    path: PathBuf,
}

impl CsvInstrumentSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(path: &PathBuf) -> Result<InstrumentFile, TaskError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| match e.kind() {
                csv::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    TaskError::permanent(format!("instrument file not found: {}", path.display()))
                }
                _ => TaskError::transient(format!("failed to open {}: {e}", path.display())),
            })?;

        let mut instruments = Vec::new();
        let mut rejected = 0;
        for (line, row) in reader.deserialize::<Instrument>().enumerate() {
            match row {
                Ok(instrument) => instruments.push(instrument),
                Err(e) => {
                    warn!(line = line + 2, error = %e, "rejecting malformed instrument row");
                    rejected += 1;
                }
            }
        }
        Ok(InstrumentFile::new(instruments, rejected))
    }
}

#[async_trait::async_trait]
impl InstrumentSource for CsvInstrumentSource {
    async fn load(&self) -> Result<InstrumentFile, TaskError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read_all(&path))
            .await
            .map_err(|e| TaskError::transient(format!("instrument reader failed: {e}")))?
    }
}

/// A security as held by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    pub ticker: String,
    pub name: String,
    pub isin: Option<String>,
    pub security_type_id: i32,
    pub currency: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

/// Securities keyed by upper-cased ticker.
#[derive(Debug, Default)]
pub struct SecurityCatalog {
    securities: Mutex<BTreeMap<String, Security>>,
}

impl SecurityCatalog {
    /// Apply one batch atomically.
    pub async fn upsert_batch(&self, batch: &[Instrument]) -> BatchOutcome {
        let mut securities = self.securities.lock().await;
        let mut outcome = BatchOutcome::default();

        for instrument in batch {
            let ticker = instrument.ticker.trim().to_uppercase();
            let name = instrument.name.trim();
            if ticker.is_empty() || name.is_empty() {
                outcome.failed += 1;
                continue;
            }

            match securities.get_mut(&ticker) {
                Some(existing) => {
                    existing.name = name.to_string();
                    existing.isin = instrument.isin.clone();
                    existing.security_type_id = instrument.security_type_id;
                    existing.currency = instrument.currency.clone();
                    outcome.updated += 1;
                }
                None => {
                    securities.insert(
                        ticker.clone(),
                        Security {
                            ticker,
                            name: name.to_string(),
                            isin: instrument.isin.clone(),
                            security_type_id: instrument.security_type_id,
                            currency: instrument.currency.clone(),
                            created_by: IMPORT_ACTOR.to_string(),
                        },
                    );
                    outcome.created += 1;
                }
            }
        }
        outcome
    }

    pub async fn get(&self, ticker: &str) -> Option<Security> {
        self.securities.lock().await.get(&ticker.to_uppercase()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.securities.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Progress of one import job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportProgress {
    pub next_offset: usize,
    pub batches: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

impl ImportProgress {
    fn processed(&self) -> u64 {
        self.created + self.updated + self.failed
    }
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    progress: ImportProgress,
    touched_at: Instant,
}

/// Last committed batch per job.
///
/// Entries untouched for longer than the retention are dropped on the next
/// commit, which bounds the map by the number of recently active imports.
#[derive(Debug)]
pub struct ImportCheckpoints {
    entries: Mutex<HashMap<JobId, Checkpoint>>,
    retention: Duration,
}

impl Default for ImportCheckpoints {
    fn default() -> Self {
        Self::with_retention(DEFAULT_CHECKPOINT_RETENTION)
    }
}

impl ImportCheckpoints {
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub async fn get(&self, job_id: JobId) -> Option<ImportProgress> {
        self.entries.lock().await.get(&job_id).map(|c| c.progress)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn commit(&self, job_id: JobId, progress: ImportProgress) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, c| now.duration_since(c.touched_at) < self.retention);
        entries.insert(job_id, Checkpoint { progress, touched_at: now });
    }
}

/// Imports B3 instruments into the security catalog.
pub struct FileImportHandler {
    source: Arc<dyn InstrumentSource>,
    catalog: Arc<SecurityCatalog>,
    checkpoints: Arc<ImportCheckpoints>,
    batch_size: usize,
}

impl FileImportHandler {
    pub fn new(
        source: Arc<dyn InstrumentSource>,
        catalog: Arc<SecurityCatalog>,
        checkpoints: Arc<ImportCheckpoints>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            catalog,
            checkpoints,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for FileImportHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<String, TaskError> {
        let mut progress = self.checkpoints.get(ctx.job_id).await.unwrap_or_default();
        if progress.next_offset > 0 {
            info!(
                job_id = %ctx.job_id,
                attempt = ctx.attempt,
                resume_offset = progress.next_offset,
                "resuming instrument import from checkpoint"
            );
        } else {
            info!(job_id = %ctx.job_id, reference_id = %ctx.reference_id, batch_size = self.batch_size, "starting instrument import");
        }

        let file = self.source.load().await?;
        if progress.batches == 0 && file.rejected > 0 {
            warn!(job_id = %ctx.job_id, rejected = file.rejected, "instrument file has malformed rows");
            progress.failed += file.rejected;
        }

        while progress.next_offset < file.instruments.len() {
            if ctx.stop.is_raised() {
                return Err(TaskError::transient(format!(
                    "interrupted by shutdown after {} instruments",
                    progress.processed()
                )));
            }

            let end = (progress.next_offset + self.batch_size).min(file.instruments.len());
            let batch = &file.instruments[progress.next_offset..end];
            let outcome = self.catalog.upsert_batch(batch).await;
            progress.next_offset = end;
            progress.batches += 1;
            progress.created += outcome.created;
            progress.updated += outcome.updated;
            progress.failed += outcome.failed;
            self.checkpoints.commit(ctx.job_id, progress).await;

            debug!(
                job_id = %ctx.job_id,
                batch = progress.batches,
                offset = progress.next_offset,
                created = outcome.created,
                updated = outcome.updated,
                failed = outcome.failed,
                "instrument batch committed"
            );
        }

        Ok(format!(
            "Import completed: {} processed, {} created, {} updated, {} failed",
            progress.processed(),
            progress.created,
            progress.updated,
            progress.failed
        ))
    }
}
