use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::{FullSyncReport, QuickSyncReport, SyncEngine, SyncError};
use crate::mirror::{MirrorError, MirrorStore, now_unix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Quick,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Quick => f.write_str("quick"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

impl StartOutcome {
    pub fn started(&self) -> bool {
        matches!(self, StartOutcome::Started)
    }
}

// Serialized as `{"started": bool}`.
impl Serialize for StartOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StartOutcome", 1)?;
        state.serialize_field("started", &self.started())?;
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobReport {
    Full(FullSyncReport),
    Quick(QuickSyncReport),
}

/// Outcome of one sync job, persisted as JSON in the sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub mode: SyncMode,
    pub outcome: JobOutcome,
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<JobReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    fn completed(mode: SyncMode, report: JobReport, finished_at: i64) -> Self {
        Self {
            mode,
            outcome: JobOutcome::Completed,
            finished_at: format_unix(finished_at),
            report: Some(report),
            error: None,
        }
    }

    fn failed(mode: SyncMode, error: String, finished_at: i64) -> Self {
        Self {
            mode,
            outcome: JobOutcome::Failed,
            finished_at: format_unix(finished_at),
            report: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub last_full_sync_at: Option<String>,
    pub last_quick_check_at: Option<String>,
    pub next_audit_page: u32,
    pub max_product_id_seen: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
    pub last_job_result: Option<Value>,
    pub requests_last_minute: usize,
}

/// Runs at most one sync job at a time.
///
/// The slot is the persisted running flag, so a second process sharing the
/// store is rejected the same way as a second caller in this one. Every job
/// exit path, including a panic inside the job, clears the flag and records
/// the outcome.
pub struct SyncSupervisor {
    engine: Arc<SyncEngine>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSupervisor {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            current: Mutex::new(None),
        }
    }

    /// Starts `mode` in the background unless a job already holds the slot.
    pub async fn start(&self, mode: SyncMode) -> Result<StartOutcome, MirrorError> {
        if !self.engine.store().try_begin_sync().await? {
            warn!(%mode, "sync already running; start rejected");
            return Ok(StartOutcome::AlreadyRunning);
        }

        info!(%mode, "sync started");
        let engine = Arc::clone(&self.engine);
        let handle = tokio::spawn(async move {
            run_claimed(engine, mode).await;
        });
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(StartOutcome::Started)
    }

    /// Runs `mode` on the calling task. Returns `None` when the slot is taken.
    pub async fn run_to_completion(&self, mode: SyncMode) -> Result<Option<JobResult>, MirrorError> {
        if !self.engine.store().try_begin_sync().await? {
            warn!(%mode, "sync already running; start rejected");
            return Ok(None);
        }
        info!(%mode, "sync started");
        Ok(Some(run_claimed(Arc::clone(&self.engine), mode).await))
    }

    /// Waits for the job spawned by [`Self::start`], if any.
    pub async fn wait_idle(&self) {
        let handle = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("sync task ended abnormally: {err}");
            }
        }
    }

    pub async fn status(&self) -> Result<SyncStatus, MirrorError> {
        let state = self.engine.store().sync_state().await?;
        Ok(SyncStatus {
            running: state.sync_running,
            last_full_sync_at: state.last_full_sync_at.and_then(format_unix),
            last_quick_check_at: state.last_quick_check_at.and_then(format_unix),
            next_audit_page: state.next_audit_page,
            max_product_id_seen: state.max_product_id_seen,
            last_error: state.last_error,
            last_error_at: state.last_error_at.and_then(format_unix),
            last_job_result: state
                .last_job_result
                .as_deref()
                .and_then(|encoded| serde_json::from_str(encoded).ok()),
            requests_last_minute: self.engine.client().current_rpm(),
        })
    }
}

async fn run_claimed(engine: Arc<SyncEngine>, mode: SyncMode) -> JobResult {
    let job_engine = Arc::clone(&engine);
    let joined = tokio::spawn(async move { run_job(&job_engine, mode).await }).await;

    let result = match joined {
        Ok(Ok(report)) => JobResult::completed(mode, report, now_unix()),
        Ok(Err(err)) => {
            error!(%mode, "sync failed: {err}");
            JobResult::failed(mode, err.to_string(), now_unix())
        }
        Err(err) => {
            error!(%mode, "sync task aborted: {err}");
            JobResult::failed(mode, format!("sync task aborted: {err}"), now_unix())
        }
    };
    record_result(engine.store(), &result).await;
    result
}

async fn run_job(engine: &SyncEngine, mode: SyncMode) -> Result<JobReport, SyncError> {
    match mode {
        SyncMode::Full => Ok(JobReport::Full(engine.full_sync().await?)),
        SyncMode::Quick => Ok(JobReport::Quick(engine.quick_sync().await?)),
    }
}

async fn record_result(store: &MirrorStore, result: &JobResult) {
    let recorded = match serde_json::to_string(result) {
        Ok(encoded) => {
            store
                .finish_sync(&encoded, result.error.as_deref(), now_unix())
                .await
        }
        Err(err) => Err(err.into()),
    };
    if let Err(err) = recorded {
        error!("failed to record sync result: {err}");
        if let Err(err) = store.clear_sync_flag().await {
            error!("failed to clear sync flag: {err}");
        }
    }
}

pub(crate) fn format_unix(timestamp: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()?
        .format(&Rfc3339)
        .ok()
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
