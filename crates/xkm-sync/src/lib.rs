//! Backfill synchronizer: mirrors every remotely published entry that is missing locally.

use std::collections::HashMap;
use std::future::Future;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xkm_core::{Entry, SyncCursor};
use xkm_remote::{
    EntrySource, FetchError, HttpClientConfig, HttpEntrySource, RetryDisposition, DEFAULT_BASE_URL,
};
use xkm_storage::{EntryStore, SqliteEntryStore, StoreError, DEFAULT_DATABASE_PATH};

pub const CRATE_NAME: &str = "xkm-sync";

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub database_path: PathBuf,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub max_retries: usize,
    pub use_system_proxy: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: "xkm/0.1".to_string(),
            http_timeout_secs: 20,
            concurrency: 16,
            max_retries: 2,
            use_system_proxy: true,
        }
    }
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("XKM_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            base_url: std::env::var("XKM_BASE_URL").unwrap_or(defaults.base_url),
            user_agent: std::env::var("XKM_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("XKM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            concurrency: std::env::var("XKM_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.concurrency),
            max_retries: std::env::var("XKM_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            use_system_proxy: std::env::var("XKM_NO_PROXY")
                .map(|v| !matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.use_system_proxy),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            use_system_proxy: self.use_system_proxy,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            concurrency: pool_width(self.concurrency),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

fn pool_width(requested: usize) -> usize {
    requested.clamp(1, Semaphore::MAX_PERMITS)
}

/// Exponential, capped delay between fetch attempts of a single entry.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Upper bound on entries being fetched or inserted at the same time.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Failures that prevent a run from being planned at all.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot determine the latest remote entry: {0}")]
    LatestUnavailable(#[source] FetchError),
    #[error("cannot determine the highest stored entry: {0}")]
    CursorUnavailable(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Duplicate,
    Write,
    Panicked,
    Cancelled,
}

/// Terminal result of the fetch+insert unit of work for one entry number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Inserted {
        num: u32,
        title: String,
    },
    Failed {
        num: u32,
        kind: FailureKind,
        message: String,
    },
}

impl TaskOutcome {
    fn failed(num: u32, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            num,
            kind,
            message: message.into(),
        }
    }

    pub fn num(&self) -> u32 {
        match self {
            Self::Inserted { num, .. } | Self::Failed { num, .. } => *num,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Inserted { .. } => None,
            Self::Failed { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cursor: SyncCursor,
    pub planned: usize,
    /// One per planned entry, ascending by number.
    pub outcomes: Vec<TaskOutcome>,
}

impl SyncRunSummary {
    pub fn inserted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_inserted()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.inserted()
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.failure_kind() == Some(kind))
            .count()
    }
}

pub struct BackfillSynchronizer {
    source: Arc<dyn EntrySource>,
    store: Arc<dyn EntryStore>,
    options: SyncOptions,
}

impl BackfillSynchronizer {
    pub fn new(
        source: Arc<dyn EntrySource>,
        store: Arc<dyn EntryStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
        }
    }

    /// Read both heads and derive the cursor for this run.
    pub async fn plan(&self) -> Result<SyncCursor, SyncError> {
        let latest = self
            .source
            .fetch_latest()
            .await
            .map_err(SyncError::LatestUnavailable)?;
        let highest_local = self
            .store
            .highest_stored_num()
            .await
            .map_err(SyncError::CursorUnavailable)?;
        Ok(SyncCursor::new(latest.num, highest_local))
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_until(std::future::pending()).await
    }

    /// Run one backfill, stopping new work once `shutdown` resolves.
    ///
    /// Individual entry failures never fail the run; every planned entry still
    /// yields exactly one [`TaskOutcome`], including ones cancelled by shutdown.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<SyncRunSummary, SyncError>
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let cursor = self.plan().await?;
        let planned = cursor.missing_count();
        info!(
            %run_id,
            latest_remote = cursor.latest_remote,
            highest_local = ?cursor.highest_local,
            missing = planned,
            "planned backfill"
        );

        let mut outcomes = if planned == 0 {
            Vec::new()
        } else {
            self.dispatch(cursor.missing(), shutdown).await
        };
        outcomes.sort_by_key(TaskOutcome::num);

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cursor,
            planned,
            outcomes,
        };
        info!(
            %run_id,
            planned,
            inserted = summary.inserted(),
            failed = summary.failed(),
            "backfill finished"
        );
        Ok(summary)
    }

    async fn dispatch<F>(&self, missing: RangeInclusive<u32>, shutdown: F) -> Vec<TaskOutcome>
    where
        F: Future<Output = ()>,
    {
        let gate = Arc::new(Semaphore::new(pool_width(self.options.concurrency)));
        let mut tasks = JoinSet::new();
        let mut nums_by_task: HashMap<TaskId, u32> = HashMap::new();

        for num in missing {
            let handle = tasks.spawn(backfill_one(
                num,
                Arc::clone(&self.source),
                Arc::clone(&self.store),
                Arc::clone(&gate),
                self.options.backoff,
            ));
            nums_by_task.insert(handle.id(), num);
        }

        let mut outcomes = Vec::with_capacity(nums_by_task.len());
        tokio::pin!(shutdown);
        let mut shutting_down = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown, if !shutting_down => {
                    shutting_down = true;
                    gate.close();
                    warn!(pending = tasks.len(), "shutdown requested; entries not yet started will be cancelled");
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let outcome = match joined {
                        Ok((_, outcome)) => outcome,
                        Err(err) => {
                            let num = nums_by_task.get(&err.id()).copied().unwrap_or_default();
                            outcome_for_join_error(num, err)
                        }
                    };
                    log_outcome(&outcome);
                    outcomes.push(outcome);
                }
            }
        }

        outcomes
    }
}

async fn backfill_one(
    num: u32,
    source: Arc<dyn EntrySource>,
    store: Arc<dyn EntryStore>,
    gate: Arc<Semaphore>,
    backoff: BackoffPolicy,
) -> TaskOutcome {
    let Ok(_permit) = gate.acquire_owned().await else {
        return TaskOutcome::failed(num, FailureKind::Cancelled, "cancelled before fetch started");
    };

    let entry = match fetch_with_retry(source.as_ref(), num, &backoff).await {
        Ok(entry) => entry,
        Err(err) => return TaskOutcome::failed(num, FailureKind::Fetch, err.to_string()),
    };

    match store.insert(&entry).await {
        Ok(()) => TaskOutcome::Inserted {
            num,
            title: entry.title,
        },
        Err(err @ StoreError::Duplicate { .. }) => {
            TaskOutcome::failed(num, FailureKind::Duplicate, err.to_string())
        }
        Err(err) => TaskOutcome::failed(num, FailureKind::Write, err.to_string()),
    }
}

/// Fetch one entry, retrying only failures the remote client marks as retryable.
pub async fn fetch_with_retry(
    source: &dyn EntrySource,
    num: u32,
    backoff: &BackoffPolicy,
) -> Result<Entry, FetchError> {
    let mut attempt = 0;
    loop {
        match source.fetch_num(num).await {
            Ok(entry) => return Ok(entry),
            Err(err)
                if err.retry_disposition() == RetryDisposition::Retryable
                    && attempt < backoff.max_retries =>
            {
                let delay = backoff.delay_for_attempt(attempt);
                debug!(num, attempt, ?delay, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn outcome_for_join_error(num: u32, err: JoinError) -> TaskOutcome {
    if err.is_cancelled() {
        TaskOutcome::failed(num, FailureKind::Cancelled, "task was aborted")
    } else {
        TaskOutcome::failed(num, FailureKind::Panicked, err.to_string())
    }
}

fn log_outcome(outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Inserted { num, title } => info!(num, title = %title, "inserted entry"),
        TaskOutcome::Failed {
            num,
            kind: FailureKind::Duplicate,
            message,
        } => info!(num, error = %message, "entry already stored"),
        TaskOutcome::Failed { num, kind, message } => {
            warn!(num, ?kind, error = %message, "entry not stored")
        }
    }
}

/// Open the configured store, run one backfill against the remote archive and close the store.
pub async fn run_download<F>(config: &MirrorConfig, shutdown: F) -> anyhow::Result<SyncRunSummary>
where
    F: Future<Output = ()>,
{
    let source = HttpEntrySource::new(config.http_client_config())?;
    let store = Arc::new(
        SqliteEntryStore::open(&config.database_path)
            .await
            .context("opening entry store")?,
    );
    let synchronizer =
        BackfillSynchronizer::new(Arc::new(source), store.clone(), config.sync_options());

    let result = synchronizer.run_until(shutdown).await;
    let closed = store.close().await;

    let summary = result.context("running backfill")?;
    closed.context("closing entry store")?;
    Ok(summary)
}
