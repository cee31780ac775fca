//! Download Manager - bounded pool of artifact transfers
//!
//! Jobs wait in the pool's FIFO queue as `Queued` and become `Downloading`
//! when a worker slot frees up.

use super::download_task::{DownloadJob, DownloadTask};
use crate::error::{WheelhouseError, WheelhouseResult};
use crate::selector;
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;
use wheelhouse_types::{
    AggregateProgress, ArtifactDescriptor, CoreEvent, JobState, JobStatus, ResolvedPackage,
    Settings, Target,
};

#[derive(Default)]
struct JobTable {
    jobs: HashMap<Uuid, Arc<DownloadJob>>,
    /// Enqueue order
    order: Vec<Uuid>,
}

/// Download manager that coordinates all jobs
pub struct DownloadManager {
    jobs: RwLock<JobTable>,
    client: Client,
    pool: Arc<Semaphore>,
    chunk_timeout: Duration,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl DownloadManager {
    /// Create a manager with `settings.max_concurrent_downloads` workers
    pub fn new(
        settings: &Settings,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> WheelhouseResult<Self> {
        let timeout = Duration::from_secs(settings.download_timeout_secs);
        let client = Client::builder()
            .user_agent(concat!("wheelhouse/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            jobs: RwLock::new(JobTable::default()),
            client,
            pool: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
            chunk_timeout: timeout,
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    fn job(&self, id: Uuid) -> WheelhouseResult<Arc<DownloadJob>> {
        self.jobs
            .read()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(WheelhouseError::JobNotFound(id))
    }

    fn emit(&self, state: JobState) {
        let _ = self.event_tx.send(CoreEvent::JobProgress { state });
    }

    /// Add a job for `artifact` into `destination_dir`.
    ///
    /// A file of the same name already in place completes the job without
    /// any transfer.
    pub async fn enqueue(
        &self,
        package: &ResolvedPackage,
        artifact: &ArtifactDescriptor,
        destination_dir: &Path,
    ) -> WheelhouseResult<Uuid> {
        let filename = Path::new(&artifact.filename)
            .file_name()
            .ok_or_else(|| {
                WheelhouseError::InvalidOperation(format!(
                    "artifact filename '{}' is not a file name",
                    artifact.filename
                ))
            })?
            .to_os_string();
        let destination = destination_dir.join(filename);

        let id = Uuid::new_v4();
        let job = Arc::new(DownloadJob::new(JobState {
            id,
            package_name: package.name().to_string(),
            version: package.version().to_string(),
            is_dependency: package.is_dependency,
            filename: artifact.filename.clone(),
            url: artifact.url.clone(),
            destination: destination.clone(),
            status: JobStatus::Queued,
            transferred: 0,
            total: 0,
            speed: 0,
            eta: None,
            error: None,
            retryable: false,
            started_at: None,
            finished_at: None,
        }));

        {
            let mut table = self.jobs.write();
            table.jobs.insert(id, job.clone());
            table.order.push(id);
        }

        match tokio::fs::metadata(&destination).await {
            Ok(meta) if meta.is_file() => {
                info!(
                    "{} already present ({} bytes), skipping",
                    artifact.filename,
                    meta.len()
                );
                let state = job.complete_existing(meta.len())?;
                self.emit(state);
            }
            _ => {
                info!("Queued {} for {}", artifact.filename, package.name());
                let generation = job.generation();
                self.schedule(job, generation);
            }
        }

        Ok(id)
    }

    /// Select the best artifact of `package` for `target` and enqueue it.
    ///
    /// Returns `None` (and emits [`CoreEvent::NoCompatibleArtifact`]) when
    /// no wheel fits.
    pub async fn enqueue_package(
        &self,
        package: &ResolvedPackage,
        target: &Target,
        destination_dir: &Path,
    ) -> WheelhouseResult<Option<Uuid>> {
        let Some(artifact) = selector::select(&package.metadata.artifacts, target) else {
            warn!(
                "No compatible wheel for {} {} (python {}, platform {})",
                package.name(),
                package.version(),
                target.python_version,
                target.platform
            );
            let _ = self.event_tx.send(CoreEvent::NoCompatibleArtifact {
                name: package.name().to_string(),
                version: package.version().to_string(),
            });
            return Ok(None);
        };

        let artifact = artifact.clone();
        self.enqueue(package, &artifact, destination_dir).await.map(Some)
    }

    fn schedule(&self, job: Arc<DownloadJob>, generation: u64) {
        self.emit(job.snapshot());

        let task = DownloadTask {
            job,
            generation,
            client: self.client.clone(),
            pool: self.pool.clone(),
            event_tx: self.event_tx.clone(),
            chunk_timeout: self.chunk_timeout,
        };
        tokio::spawn(task.run());
    }

    /// Request cancellation. A job still waiting for a worker is cancelled
    /// at once; a running one stops at its next chunk.
    pub fn cancel(&self, id: Uuid) -> WheelhouseResult<()> {
        let job = self.job(id)?;
        if let Some(state) = job.cancel() {
            info!("Cancelled queued job {}", id);
            self.emit(state);
        }
        Ok(())
    }

    /// Put a failed or cancelled job back in the queue
    pub fn retry(&self, id: Uuid) -> WheelhouseResult<()> {
        let job = self.job(id)?;
        let generation = job.requeue()?;
        info!("Retrying job {}", id);
        self.schedule(job, generation);
        Ok(())
    }

    pub fn snapshot(&self, id: Uuid) -> WheelhouseResult<JobState> {
        self.job(id).map(|job| job.snapshot())
    }

    /// Every known job in enqueue order
    pub fn snapshot_all(&self) -> Vec<JobState> {
        let table = self.jobs.read();
        table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .map(|job| job.snapshot())
            .collect()
    }

    pub fn aggregate(&self) -> AggregateProgress {
        AggregateProgress::from_states(&self.snapshot_all())
    }

    /// Wait until no job is queued or downloading
    pub async fn wait_until_settled(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.aggregate().is_settled() {
                return;
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Cancel whatever is still pending and forget every job
    pub fn reset(&self) {
        let mut table = self.jobs.write();
        for job in table.jobs.values() {
            if !job.status().is_finished() {
                job.cancel();
            }
        }
        let cleared = table.order.len();
        table.jobs.clear();
        table.order.clear();
        drop(table);

        info!("Download queue reset ({} jobs cleared)", cleared);
        let _ = self.event_tx.send(CoreEvent::QueueReset);
    }
}
