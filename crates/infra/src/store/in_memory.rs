use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use corejobs_core::{JobId, JobRecord, NewJob, StatusUpdate};

use super::{
    check_fence, chrono_window, CreateOutcome, JobStats, JobStore, JobStoreError,
    DEFAULT_DUPLICATE_WINDOW,
};
use crate::query::JobQuery;

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<JobId, JobRecord>,
    by_reference: HashMap<String, Vec<JobId>>,
    last_id: i64,
}

/// In-memory job store for tests/dev.
///
/// A single write lock serialises mutations, which makes duplicate detection
/// on `create` race-free.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    duplicate_window: Duration,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn mutate<F>(&self, id: JobId, f: F) -> Result<JobRecord, JobStoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobStoreError>,
    {
        let mut inner = self.inner.write().await;
        let record = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let mut next = record.clone();
        f(&mut next)?;
        *record = next.clone();
        Ok(next)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<CreateOutcome, JobStoreError> {
        let now = Utc::now();
        let window = chrono_window(self.duplicate_window);
        let mut inner = self.inner.write().await;

        let existing = inner
            .by_reference
            .get(&job.reference_id)
            .into_iter()
            .flatten()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .find(|r| r.blocks_resubmission(window, now))
            .cloned();
        if let Some(record) = existing {
            return Ok(CreateOutcome::Existing(record));
        }

        inner.last_id += 1;
        let id = JobId::new(inner.last_id);
        let record = JobRecord::new(id, job, now);
        inner
            .by_reference
            .entry(record.reference_id.clone())
            .or_default()
            .push(id);
        inner.jobs.insert(id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        let inner = self.inner.read().await;
        inner.jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<JobRecord, JobStoreError> {
        self.mutate(id, |record| {
            check_fence(record, &update)?;
            record.transition(update.status, update.message.clone(), Utc::now())?;
            Ok(())
        })
        .await
    }

    async fn begin_attempt(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        self.mutate(id, |record| Ok(record.begin_attempt(Utc::now())?)).await
    }

    async fn fail_undelivered(&self, id: JobId, reason: &str) -> Result<JobRecord, JobStoreError> {
        self.mutate(id, |record| Ok(record.fail_undelivered(reason, Utc::now())?))
            .await
    }

    async fn list(&self, query: &JobQuery) -> Result<(Vec<JobRecord>, u64), JobStoreError> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|r| query.filter.matches(r))
            .collect();
        let total = matching.len() as u64;
        matching.sort_by(|a, b| query.compare(a, b));

        let items = matching
            .into_iter()
            .skip(usize::try_from(query.offset).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.inner.read().await;
        let mut stats = JobStats::default();
        for record in inner.jobs.values() {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }
}
