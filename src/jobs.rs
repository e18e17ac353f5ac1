//! Population job lifecycle.
//!
//! The [`JobManager`] registers jobs, enforces one active job per root name,
//! and runs the populator on a spawned tokio task. Job state lives behind the
//! [`JobStore`] trait so it can be kept in memory or in the database.

use crate::config::normalize_languages;
use crate::populator::HierarchyPopulator;
use crate::schema::{normalize_name, Job, JobStatus, LanguageCode};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Longest error message stored on a failed job.
const MAX_ERROR_CHARS: usize = 300;

/// Writes of a job's terminal state are retried this many times.
const FINAL_SAVE_ATTEMPTS: u32 = 3;
const FINAL_SAVE_BACKOFF: Duration = Duration::from_millis(250);

/// Terminal jobs whose final write never reached the store, by id.
type UnsavedTerminal = Arc<RwLock<HashMap<String, Job>>>;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("a job for '{root_name}' is already active ({job_id})")]
    AlreadyActive { job_id: String, root_name: String },
    #[error("a job for '{root_name}' already completed ({job_id}) at {completed_at}")]
    AlreadyCompleted {
        job_id: String,
        root_name: String,
        completed_at: DateTime<Utc>,
    },
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

// ============================================================================
// Job storage
// ============================================================================

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the job with the same id.
    async fn save(&self, job: &Job) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Job>>;
    async fn list(&self) -> Result<Vec<Job>>;

    /// Every job whose normalized root name equals `root_key`.
    async fn find_by_root(&self, root_key: &str) -> Result<Vec<Job>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|j| j.root_key() == root_key)
            .collect())
    }
}

/// Process-local job store.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.write().unwrap().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().unwrap().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().unwrap().values().cloned().collect())
    }
}

// ============================================================================
// Progress tracking
// ============================================================================

/// Live handle on one job's state. Every update is written through to the store.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStore>,
    job: Arc<Mutex<Job>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>, job: Job) -> Self {
        Self {
            store,
            job: Arc::new(Mutex::new(job)),
        }
    }

    pub fn snapshot(&self) -> Job {
        self.job.lock().unwrap().clone()
    }

    /// Apply `f` to the job and persist the result. Store failures are logged only.
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Job) + Send,
    {
        let job = {
            let mut guard = self.job.lock().unwrap();
            f(&mut *guard);
            guard.clone()
        };
        if let Err(e) = self.store.save(&job).await {
            warn!("Failed to persist progress for job {}: {:#}", job.id, e);
        }
    }

    pub async fn set_step(&self, step: impl Into<String>) {
        let step = step.into();
        self.update(move |job| job.progress.current_step = step).await;
    }

    /// Apply the terminal transition and persist it, retrying the write.
    /// On `Err` the in-memory job is still terminal; see [`JobTracker::snapshot`].
    pub async fn finish<F>(&self, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let job = {
            let mut guard = self.job.lock().unwrap();
            f(&mut *guard);
            guard.clone()
        };

        let mut attempt = 1;
        loop {
            match self.store.save(&job).await {
                Ok(()) => return Ok(job),
                Err(e) if attempt < FINAL_SAVE_ATTEMPTS => {
                    warn!(
                        "Saving final state of job {} failed (attempt {}/{}): {:#}",
                        job.id, attempt, FINAL_SAVE_ATTEMPTS, e
                    );
                    tokio::time::sleep(FINAL_SAVE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("Failed to save final state of job {}", job.id)))
                }
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Result of a successful [`JobManager::start_job`].
#[derive(Debug)]
pub struct JobStarted {
    /// Snapshot taken at registration (status `queued`).
    pub job: Job,
    /// Resolves to the terminal job once the populator finishes.
    pub handle: JoinHandle<Job>,
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    populator: Arc<HierarchyPopulator>,
    default_languages: Vec<LanguageCode>,
    /// Serializes the single-flight check with job registration.
    start_lock: tokio::sync::Mutex<()>,
    unsaved: UnsavedTerminal,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        populator: Arc<HierarchyPopulator>,
        default_languages: Vec<LanguageCode>,
    ) -> Self {
        Self {
            store,
            populator,
            default_languages,
            start_lock: tokio::sync::Mutex::new(()),
            unsaved: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Prefer the in-process terminal state over a stale stored one.
    fn reconcile(&self, job: Job) -> Job {
        if job.status.is_terminal() {
            return job;
        }
        self.unsaved
            .read()
            .unwrap()
            .get(&job.id)
            .cloned()
            .unwrap_or(job)
    }

    /// Register a job for `root_name` and start populating it in the background.
    pub async fn start_job(
        &self,
        root_name: &str,
        languages: &[String],
    ) -> Result<JobStarted, JobError> {
        let root_name = root_name.trim();
        if root_name.is_empty() {
            return Err(JobError::InvalidRequest("root_name must not be empty".to_string()));
        }

        let mut languages =
            normalize_languages(languages).map_err(|e| JobError::InvalidRequest(e.to_string()))?;
        if languages.is_empty() {
            languages = self.default_languages.clone();
        }

        let _guard = self.start_lock.lock().await;

        let existing: Vec<Job> = self
            .store
            .find_by_root(&normalize_name(root_name))
            .await?
            .into_iter()
            .map(|job| self.reconcile(job))
            .collect();
        if let Some(active) = existing.iter().find(|j| j.status.is_active()) {
            return Err(JobError::AlreadyActive {
                job_id: active.id.clone(),
                root_name: active.root_name.clone(),
            });
        }
        if let Some(done) = existing
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .max_by_key(|j| j.completed_at)
        {
            return Err(JobError::AlreadyCompleted {
                job_id: done.id.clone(),
                root_name: done.root_name.clone(),
                completed_at: done.completed_at.unwrap_or(done.created_at),
            });
        }

        let job = Job::new(root_name, languages);
        self.store.save(&job).await?;
        info!(
            "Registered job {} for '{}' ({:?})",
            job.id, job.root_name, job.target_languages
        );

        let tracker = JobTracker::new(self.store.clone(), job.clone());
        let handle = tokio::spawn(run_job(self.populator.clone(), tracker, self.unsaved.clone()));

        Ok(JobStarted { job, handle })
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Job, JobError> {
        self.store
            .get(job_id)
            .await?
            .map(|job| self.reconcile(job))
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|job| self.reconcile(job))
            .collect())
    }

    /// Mark jobs left queued/processing by a previous process as failed.
    pub async fn recover_interrupted(&self) -> Result<usize, JobError> {
        let _guard = self.start_lock.lock().await;
        let mut recovered = 0;
        for mut job in self.store.list().await? {
            if job.status.is_active() {
                job.status = JobStatus::Failed;
                job.error = Some("interrupted by restart".to_string());
                job.completed_at = Some(Utc::now());
                self.store.save(&job).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!("Marked {} interrupted job(s) as failed", recovered);
        }
        Ok(recovered)
    }
}

/// Task body: drive the populator and record the terminal state.
async fn run_job(populator: Arc<HierarchyPopulator>, tracker: JobTracker, unsaved: UnsavedTerminal) -> Job {
    tracker
        .update(|job| {
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            job.progress.current_step = "starting".to_string();
        })
        .await;

    // Inner task so a panic in the walk is observed here as a JoinError.
    let inner = {
        let tracker = tracker.clone();
        tokio::spawn(async move { populator.populate(&tracker).await })
    };

    let saved = match inner.await {
        Ok(Ok(report)) => {
            tracker
                .finish(move |job| {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    job.progress.current_step = "completed".to_string();
                    job.progress.languages_completed = report.languages_completed;
                })
                .await
        }
        Ok(Err(e)) => {
            let message = truncate_message(&format!("{:#}", e));
            error!("Job {} failed: {}", tracker.snapshot().id, message);
            tracker.finish(move |job| mark_failed(job, message)).await
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                "population task panicked".to_string()
            } else {
                "population task was cancelled".to_string()
            };
            error!("Job {} aborted: {}", tracker.snapshot().id, message);
            tracker.finish(move |job| mark_failed(job, message)).await
        }
    };

    let job = tracker.snapshot();
    if let Err(e) = saved {
        error!("{:#}; serving the terminal state from memory", e);
        unsaved.write().unwrap().insert(job.id.clone(), job.clone());
    }

    info!(
        "Job {} for '{}' finished: {:?} ({} external calls, {} failed branches)",
        job.id,
        job.root_name,
        job.status,
        job.progress.external_calls,
        job.failed_nodes.len()
    );
    job
}

fn mark_failed(job: &mut Job, message: String) {
    job.status = JobStatus::Failed;
    job.completed_at = Some(Utc::now());
    job.progress.current_step = "failed".to_string();
    job.error = Some(message);
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        message.to_string()
    } else {
        let mut out: String = message.chars().take(MAX_ERROR_CHARS).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{HierarchyNode, Level};
    use crate::store::{MemoryReferenceStore, ReferenceStore};
    use crate::test_support::{fast_config, populator_for, FakeGeoProvider};
    use uuid::Uuid;

    fn langs(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    fn manager(store: &MemoryReferenceStore, provider: &Arc<FakeGeoProvider>) -> JobManager {
        let populator = populator_for(Arc::new(store.clone()), provider.clone(), fast_config());
        JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(populator),
            langs(&["en"]),
        )
    }

    #[tokio::test]
    async fn test_lakeland_scenario() {
        let store = MemoryReferenceStore::new();
        let provider = Arc::new(FakeGeoProvider::new(2));
        let manager = manager(&store, &provider);

        let started = manager.start_job("Lakeland", &langs(&["fr", "es"])).await.unwrap();
        assert_eq!(started.job.status, JobStatus::Queued);

        let job = started.handle.await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(job.progress.level1_total, 2);
        assert_eq!(job.progress.level1_processed, 2);
        assert_eq!(job.progress.level2_processed, 4);
        assert_eq!(job.progress.level3_processed, 8);

        for sub_region in store.nodes_at(Level::SubRegion) {
            assert!(store.localized_name(sub_region.id, "fr").is_some());
            assert!(store.localized_name(sub_region.id, "es").is_some());
        }

        let jobs = manager.list_jobs().await.unwrap();
        let lakeland: Vec<&Job> = jobs.iter().filter(|j| j.root_name == "Lakeland").collect();
        assert_eq!(lakeland.len(), 1);
        assert_eq!(lakeland[0].progress.languages_completed, langs(&["fr", "es"]));
        assert_eq!(manager.get_status(&job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_single_flight_rejects_second_start() {
        let store = MemoryReferenceStore::new();
        let provider = Arc::new(FakeGeoProvider::new(1).gated());
        let manager = manager(&store, &provider);

        let first = manager.start_job("Lakeland", &langs(&["fr"])).await.unwrap();
        let err = manager.start_job(" LAKELAND ", &langs(&["es"])).await.unwrap_err();
        match err {
            JobError::AlreadyActive { job_id, .. } => assert_eq!(job_id, first.job.id),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
        assert_eq!(manager.list_jobs().await.unwrap().len(), 1);

        provider.open_gate();
        let job = first.handle.await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_job_blocks_restart_with_details() {
        let store = MemoryReferenceStore::new();
        let provider = Arc::new(FakeGeoProvider::new(1));
        let manager = manager(&store, &provider);

        let job = manager
            .start_job("Lakeland", &langs(&["fr"]))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        match manager.start_job("lakeland", &langs(&["fr"])).await {
            Err(JobError::AlreadyCompleted {
                job_id,
                completed_at,
                ..
            }) => {
                assert_eq!(job_id, job.id);
                assert_eq!(Some(completed_at), job.completed_at);
            }
            other => panic!("expected AlreadyCompleted, got {:?}", other.map(|s| s.job)),
        }
    }

    #[tokio::test]
    async fn test_second_run_is_free_and_adds_nothing() {
        let store = MemoryReferenceStore::new();
        let provider = Arc::new(FakeGeoProvider::new(2));

        let first = manager(&store, &provider)
            .start_job("Lakeland", &langs(&["fr", "es"]))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        let nodes = store.node_count();
        let localized = store.localized_count();
        provider.reset_calls();

        // Fresh manager: job history is process-local, reference data is not.
        let second = manager(&store, &provider)
            .start_job("Lakeland", &langs(&["fr", "es"]))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(second.progress.external_calls, 0);
        assert_eq!(store.node_count(), nodes);
        assert_eq!(store.localized_count(), localized);
        assert_eq!(second.progress.level3_processed, first.progress.level3_processed);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let store = MemoryReferenceStore::new();
        let provider = Arc::new(FakeGeoProvider::new(1));
        let manager = manager(&store, &provider);

        assert!(matches!(
            manager.start_job("   ", &[]).await,
            Err(JobError::InvalidRequest(_))
        ));
        assert!(matches!(
            manager.start_job("Lakeland", &langs(&["not a code"])).await,
            Err(JobError::InvalidRequest(_))
        ));
        assert!(matches!(
            manager.get_status("job_missing").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_default_languages_used_when_none_given() {
        let store = MemoryReferenceStore::new();
        let provider = Arc::new(FakeGeoProvider::new(1));
        let started = manager(&store, &provider).start_job("Lakeland", &[]).await.unwrap();
        assert_eq!(started.job.target_languages, langs(&["en"]));
        started.handle.await.unwrap();
    }

    /// Delegates to the memory store but refuses to create regions.
    struct RejectingRegionStore(MemoryReferenceStore);

    #[async_trait::async_trait]
    impl ReferenceStore for RejectingRegionStore {
        async fn find_by_name_under_parent(
            &self,
            level: Level,
            name: &str,
            parent_id: Option<Uuid>,
        ) -> Result<Option<HierarchyNode>> {
            self.0.find_by_name_under_parent(level, name, parent_id).await
        }

        async fn create_node(
            &self,
            level: Level,
            name: &str,
            parent_id: Option<Uuid>,
        ) -> Result<(HierarchyNode, bool)> {
            if level == Level::Region {
                anyhow::bail!("permission denied for table regions");
            }
            self.0.create_node(level, name, parent_id).await
        }

        async fn list_active_children(&self, level: Level, parent_id: Uuid) -> Result<Vec<HierarchyNode>> {
            self.0.list_active_children(level, parent_id).await
        }

        async fn localized_languages(&self, node_id: Uuid) -> Result<Vec<LanguageCode>> {
            self.0.localized_languages(node_id).await
        }

        async fn create_localized(&self, node_id: Uuid, language: &str, name: &str) -> Result<bool> {
            self.0.create_localized(node_id, language, name).await
        }
    }

    #[tokio::test]
    async fn test_unresolvable_root_fails_job() {
        let provider = Arc::new(FakeGeoProvider::new(2));
        let store = Arc::new(RejectingRegionStore(MemoryReferenceStore::new()));
        let populator = populator_for(store, provider.clone(), fast_config());
        let manager = JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(populator),
            langs(&["en"]),
        );

        let job = manager
            .start_job("Lakeland", &langs(&["fr"]))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error.unwrap();
        assert!(message.contains("permission denied"));
        assert_eq!(provider.call_count(), 0);

        // A failed job does not block a new attempt.
        assert!(!matches!(
            manager.start_job("Lakeland", &langs(&["fr"])).await,
            Err(JobError::AlreadyActive { .. }) | Err(JobError::AlreadyCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_jobs() {
        let job_store = Arc::new(MemoryJobStore::new());
        let mut stale = Job::new("Lakeland", langs(&["fr"]));
        stale.status = JobStatus::Processing;
        job_store.save(&stale).await.unwrap();

        let provider = Arc::new(FakeGeoProvider::new(1));
        let populator = populator_for(Arc::new(MemoryReferenceStore::new()), provider, fast_config());
        let manager = JobManager::new(job_store.clone(), Arc::new(populator), langs(&["en"]));

        assert_eq!(manager.recover_interrupted().await.unwrap(), 1);
        let recovered = manager.get_status(&stale.id).await.unwrap();
        assert_eq!(recovered.status, JobStatus::Failed);
        assert_eq!(recovered.error.as_deref(), Some("interrupted by restart"));

        let started = manager.start_job("Lakeland", &langs(&["fr"])).await.unwrap();
        assert_eq!(started.handle.await.unwrap().status, JobStatus::Completed);
    }

    /// Accepts every write except the terminal one.
    #[derive(Default)]
    struct TerminalWriteFailingStore(MemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for TerminalWriteFailingStore {
        async fn save(&self, job: &Job) -> Result<()> {
            if job.status.is_terminal() {
                anyhow::bail!("connection reset by peer");
            }
            self.0.save(job).await
        }

        async fn get(&self, id: &str) -> Result<Option<Job>> {
            self.0.get(id).await
        }

        async fn list(&self) -> Result<Vec<Job>> {
            self.0.list().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsaved_final_state_does_not_block_root() {
        let job_store = Arc::new(TerminalWriteFailingStore::default());
        let provider = Arc::new(FakeGeoProvider::new(1));
        let populator = populator_for(Arc::new(MemoryReferenceStore::new()), provider, fast_config());
        let manager = JobManager::new(job_store.clone(), Arc::new(populator), langs(&["en"]));

        let job = manager
            .start_job("Lakeland", &langs(&["fr"]))
            .await
            .unwrap()
            .handle
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let stored = job_store.0.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);

        assert_eq!(manager.get_status(&job.id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(manager.list_jobs().await.unwrap()[0].status, JobStatus::Completed);
        match manager.start_job("lakeland", &langs(&["fr"])).await {
            Err(JobError::AlreadyCompleted { job_id, .. }) => assert_eq!(job_id, job.id),
            other => panic!("expected AlreadyCompleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_final_save_is_retried() {
        /// Fails the first terminal write only.
        #[derive(Default)]
        struct FlakyOnceStore {
            inner: MemoryJobStore,
            failed: Mutex<bool>,
        }

        #[async_trait::async_trait]
        impl JobStore for FlakyOnceStore {
            async fn save(&self, job: &Job) -> Result<()> {
                if job.status.is_terminal() {
                    let mut failed = self.failed.lock().unwrap();
                    if !*failed {
                        *failed = true;
                        anyhow::bail!("timeout");
                    }
                }
                self.inner.save(job).await
            }

            async fn get(&self, id: &str) -> Result<Option<Job>> {
                self.inner.get(id).await
            }

            async fn list(&self) -> Result<Vec<Job>> {
                self.inner.list().await
            }
        }

        let store = Arc::new(FlakyOnceStore::default());
        let mut job = Job::new("Lakeland", langs(&["fr"]));
        job.status = JobStatus::Processing;
        let tracker = JobTracker::new(store.clone(), job);

        let saved = tracker
            .finish(|job| mark_failed(job, "boom".to_string()))
            .await
            .unwrap();
        let stored = store.inner.get(&saved.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_truncate_message() {
        let long = "x".repeat(MAX_ERROR_CHARS + 10);
        let out = truncate_message(&long);
        assert_eq!(out.chars().count(), MAX_ERROR_CHARS + 1);
        assert_eq!(truncate_message("short"), "short");
    }
}
