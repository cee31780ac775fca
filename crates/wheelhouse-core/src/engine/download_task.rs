//! Download job and the task that executes it
//!
//! A job's fields are written by the worker executing it. Callers only
//! flip the cancel flag, plus the status of a job that has not started.

use crate::error::{WheelhouseError, WheelhouseResult};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wheelhouse_types::{CoreEvent, JobState, JobStatus};

struct JobSlot {
    state: JobState,
    /// Bumped on every (re)schedule so stale workers step aside
    generation: u64,
    /// Wakes the worker of the current generation out of a pending await
    token: CancellationToken,
}

/// One artifact transfer
pub struct DownloadJob {
    slot: Mutex<JobSlot>,
    cancelled: AtomicBool,
}

impl DownloadJob {
    pub(crate) fn new(state: JobState) -> Self {
        Self {
            slot: Mutex::new(JobSlot {
                state,
                generation: 0,
                token: CancellationToken::new(),
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.slot.lock().state.id
    }

    pub fn snapshot(&self) -> JobState {
        self.slot.lock().state.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.slot.lock().state.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.slot.lock().token.cancel();
    }

    /// Raise the cancel flag; a job no worker has claimed yet is cancelled
    /// on the spot and its new snapshot returned
    pub(crate) fn cancel(&self) -> Option<JobState> {
        let mut slot = self.slot.lock();
        self.cancelled.store(true, Ordering::Release);
        slot.token.cancel();
        if slot.state.status != JobStatus::Queued {
            return None;
        }
        slot.state.status = JobStatus::Cancelled;
        slot.state.finished_at = Some(Utc::now());
        Some(slot.state.clone())
    }

    /// Move to `next` if the state machine allows it, returning the new
    /// snapshot
    pub(crate) fn transition(&self, next: JobStatus) -> WheelhouseResult<JobState> {
        let mut slot = self.slot.lock();
        let state = &mut slot.state;
        if !state.status.can_transition_to(next) {
            return Err(WheelhouseError::InvalidTransition {
                id: state.id,
                from: state.status,
                to: next,
            });
        }

        state.status = next;
        match next {
            JobStatus::Downloading => state.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                state.finished_at = Some(Utc::now());
                state.eta = None;
            }
            JobStatus::Queued => {}
        }
        Ok(state.clone())
    }

    /// Mark as already present on disk
    pub(crate) fn complete_existing(&self, size: u64) -> WheelhouseResult<JobState> {
        {
            let mut slot = self.slot.lock();
            slot.state.transferred = size;
            slot.state.total = size;
        }
        self.transition(JobStatus::Completed)
    }

    /// Reset for a retry and return the generation the new worker owns
    pub(crate) fn requeue(&self) -> WheelhouseResult<u64> {
        let mut slot = self.slot.lock();
        let state = &mut slot.state;
        if !state.status.can_retry() {
            return Err(WheelhouseError::InvalidTransition {
                id: state.id,
                from: state.status,
                to: JobStatus::Queued,
            });
        }

        state.status = JobStatus::Queued;
        state.transferred = 0;
        state.total = 0;
        state.speed = 0;
        state.eta = None;
        state.error = None;
        state.retryable = false;
        state.started_at = None;
        state.finished_at = None;
        self.cancelled.store(false, Ordering::Release);

        slot.token = CancellationToken::new();
        slot.generation += 1;
        Ok(slot.generation)
    }

    /// Generation of a freshly queued job
    pub(crate) fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    /// Claim the job for the worker of `generation`.
    ///
    /// Fails when the job was cancelled or rescheduled while waiting.
    fn begin(&self, generation: u64) -> Option<(JobState, CancellationToken)> {
        let mut slot = self.slot.lock();
        if slot.generation != generation
            || slot.state.status != JobStatus::Queued
            || self.is_cancelled()
        {
            return None;
        }
        slot.state.status = JobStatus::Downloading;
        slot.state.started_at = Some(Utc::now());
        Some((slot.state.clone(), slot.token.clone()))
    }

    fn set_total(&self, total: u64) {
        self.slot.lock().state.total = total;
    }

    /// Record `len` more bytes written and recompute speed and ETA
    fn advance(&self, len: u64) -> JobState {
        let mut slot = self.slot.lock();
        let state = &mut slot.state;
        state.transferred += len;

        let elapsed_ms = state
            .started_at
            .map(|t| (Utc::now() - t).num_milliseconds())
            .unwrap_or(0)
            .max(1) as u64;
        state.speed = state.transferred.saturating_mul(1000) / elapsed_ms;
        state.eta = if state.speed > 0 && state.total > 0 {
            Some(state.total.saturating_sub(state.transferred) / state.speed)
        } else {
            None
        };
        state.clone()
    }

    fn record_error(&self, error: &WheelhouseError) {
        let mut slot = self.slot.lock();
        slot.state.error = Some(error.to_string());
        slot.state.retryable = error.is_retryable();
    }

    fn settle_total(&self) {
        let mut slot = self.slot.lock();
        if slot.state.total == 0 {
            slot.state.total = slot.state.transferred;
        }
    }
}

/// How a transfer ended when no error occurred
enum TransferOutcome {
    Completed,
    Cancelled,
}

/// Executes one job under the manager's worker pool
pub(crate) struct DownloadTask {
    pub job: Arc<DownloadJob>,
    pub generation: u64,
    pub client: Client,
    pub pool: Arc<Semaphore>,
    pub event_tx: broadcast::Sender<CoreEvent>,
    /// Longest wait for the next chunk
    pub chunk_timeout: Duration,
}

impl DownloadTask {
    pub async fn run(self) {
        let Ok(_permit) = self.pool.clone().acquire_owned().await else {
            return;
        };

        let Some((state, token)) = self.job.begin(self.generation) else {
            debug!("Job {} no longer waiting, skipping", self.job.id());
            return;
        };
        info!("Downloading {} -> {}", state.url, state.destination.display());
        let destination = state.destination.clone();
        self.emit(state);

        match self.transfer(&token).await {
            Ok(TransferOutcome::Completed) => {
                self.job.settle_total();
                self.finish(JobStatus::Completed);
            }
            Ok(TransferOutcome::Cancelled) => self.finish(JobStatus::Cancelled),
            // A transfer that broke after the user cancelled still counts as cancelled
            Err(e) if self.job.is_cancelled() => {
                debug!("Download {} ended after cancel: {}", destination.display(), e);
                remove_partial(&destination).await;
                self.finish(JobStatus::Cancelled);
            }
            Err(e) => {
                error!("Download of {} failed: {}", self.job.snapshot().filename, e);
                self.job.record_error(&e);
                self.finish(JobStatus::Failed);
            }
        }
    }

    async fn transfer(&self, token: &CancellationToken) -> WheelhouseResult<TransferOutcome> {
        let snapshot = self.job.snapshot();
        let destination = snapshot.destination.as_path();
        let stalled = || {
            WheelhouseError::Timeout(format!(
                "no data for {}s from {}",
                self.chunk_timeout.as_secs(),
                snapshot.url
            ))
        };

        let request = self.client.get(&snapshot.url).send();
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Download {} cancelled before response", snapshot.id);
                return Ok(TransferOutcome::Cancelled);
            }
            sent = tokio::time::timeout(self.chunk_timeout, request) => {
                sent.map_err(|_| stalled())??
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Err(WheelhouseError::ServerError {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unexpected status").to_string(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        self.job.set_total(total);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut transferred = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = tokio::time::timeout(self.chunk_timeout, stream.next()) => {
                    Some(next.map_err(|_| stalled())?)
                }
            };
            let chunk = match next {
                Some(Some(chunk)) => chunk,
                Some(None) => break,
                // Woken by cancel
                None => {
                    drop(file);
                    remove_partial(destination).await;
                    info!("Download {} cancelled", snapshot.id);
                    return Ok(TransferOutcome::Cancelled);
                }
            };

            if self.job.is_cancelled() {
                drop(file);
                remove_partial(destination).await;
                info!("Download {} cancelled", snapshot.id);
                return Ok(TransferOutcome::Cancelled);
            }

            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            if total > 0 && transferred + len > total {
                return Err(WheelhouseError::InvalidOperation(format!(
                    "received more than the declared {} bytes",
                    total
                )));
            }

            file.write_all(&chunk).await?;
            transferred += len;
            let state = self.job.advance(len);
            self.emit(state);
        }

        file.flush().await?;
        Ok(TransferOutcome::Completed)
    }

    fn finish(&self, status: JobStatus) {
        match self.job.transition(status) {
            Ok(state) => {
                info!("Job {} {}", state.id, state.status);
                self.emit(state);
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn emit(&self, state: JobState) {
        let _ = self.event_tx.send(CoreEvent::JobProgress { state });
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn queued() -> DownloadJob {
        DownloadJob::new(JobState {
            id: Uuid::new_v4(),
            package_name: "pkg".into(),
            version: "1.0".into(),
            is_dependency: false,
            filename: "pkg-1.0-py3-none-any.whl".into(),
            url: "https://files.example/pkg-1.0-py3-none-any.whl".into(),
            destination: PathBuf::from("/tmp/pkg-1.0-py3-none-any.whl"),
            status: JobStatus::Queued,
            transferred: 0,
            total: 0,
            speed: 0,
            eta: None,
            error: None,
            retryable: false,
            started_at: None,
            finished_at: None,
        })
    }

    #[test]
    fn test_begin_claims_once() {
        let job = queued();
        let generation = job.generation();
        assert!(job.begin(generation).is_some());
        assert_eq!(job.status(), JobStatus::Downloading);
        assert!(job.begin(generation).is_none());
    }

    #[test]
    fn test_stale_worker_steps_aside() {
        let job = queued();
        let stale = job.generation();
        job.transition(JobStatus::Cancelled).unwrap();
        let fresh = job.requeue().unwrap();

        assert!(job.begin(stale).is_none());
        assert!(job.begin(fresh).is_some());
    }

    #[test]
    fn test_requeue_resets_progress() {
        let job = queued();
        job.begin(job.generation()).unwrap();
        job.set_total(100);
        job.advance(40);
        job.record_error(&WheelhouseError::Timeout("no data".into()));
        assert!(job.snapshot().retryable);
        job.transition(JobStatus::Failed).unwrap();
        job.request_cancel();

        job.requeue().unwrap();
        let state = job.snapshot();
        assert_eq!(state.status, JobStatus::Queued);
        assert_eq!(state.transferred, 0);
        assert_eq!(state.error, None);
        assert!(!state.retryable);
        assert!(!job.is_cancelled());
    }

    #[test]
    fn test_cancel_only_settles_waiting_jobs() {
        let waiting = queued();
        assert_eq!(waiting.cancel().map(|s| s.status), Some(JobStatus::Cancelled));

        let running = queued();
        running.begin(running.generation()).unwrap();
        assert!(running.cancel().is_none());
        assert!(running.is_cancelled());
        assert_eq!(running.status(), JobStatus::Downloading);
    }

    #[test]
    fn test_cancel_wakes_only_current_generation() {
        let job = queued();
        let (_, first) = job.begin(job.generation()).unwrap();
        assert!(!first.is_cancelled());

        job.cancel();
        assert!(first.is_cancelled());

        job.transition(JobStatus::Cancelled).unwrap();
        let generation = job.requeue().unwrap();
        let (_, second) = job.begin(generation).unwrap();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_requeue_rejected_when_completed() {
        let job = queued();
        job.complete_existing(10).unwrap();
        assert!(matches!(
            job.requeue(),
            Err(WheelhouseError::InvalidTransition {
                from: JobStatus::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_advance_computes_eta() {
        let job = queued();
        job.begin(job.generation()).unwrap();
        job.set_total(1_000_000);
        let state = job.advance(1000);
        assert_eq!(state.transferred, 1000);
        assert!(state.speed > 0);
        assert!(state.eta.is_some());
    }
}
