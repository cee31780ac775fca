//! Wheelhouse Core - offline package downloader
//!
//! Looks packages up on a package index, walks their dependency graph,
//! picks the wheel that fits a target interpreter/platform and downloads
//! the lot through a bounded worker pool.

mod engine;
mod error;
mod index;
mod requirement;
mod resolver;
pub mod selector;
mod staging;
mod storage;
mod transfer;

pub use engine::*;
pub use error::*;
pub use index::*;
pub use requirement::*;
pub use resolver::*;
pub use staging::*;
pub use storage::*;
pub use transfer::*;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;
use wheelhouse_types::{CoreEvent, PackageMetadata, Settings, Target};

/// The main Wheelhouse core instance
pub struct WheelhouseCore {
    settings: Settings,
    source: Arc<dyn MetadataSource>,
    resolver: Resolver,
    downloads: Arc<DownloadManager>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl WheelhouseCore {
    /// Create a core talking to the index configured in `settings`
    pub fn new(settings: Settings) -> WheelhouseResult<Self> {
        validate(&settings)?;
        let source = Arc::new(IndexClient::new(&settings)?);
        Self::with_source(settings, source)
    }

    /// Create a core on top of any metadata source
    pub fn with_source(
        settings: Settings,
        source: Arc<dyn MetadataSource>,
    ) -> WheelhouseResult<Self> {
        validate(&settings)?;
        let (event_tx, _) = broadcast::channel(1000);
        let downloads = Arc::new(DownloadManager::new(&settings, event_tx.clone())?);

        Ok(Self {
            resolver: Resolver::new(source.clone()),
            settings,
            source,
            downloads,
            event_tx,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn target(&self) -> Target {
        self.settings.target()
    }

    /// Marker environment derived from the configured target
    pub fn environment(&self) -> MarkerEnvironment {
        MarkerEnvironment::from_target(&self.target())
    }

    /// Subscribe to download events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    // ========================================================================
    // Lookup & Resolution
    // ========================================================================

    /// Metadata for a single requirement string
    pub async fn lookup(&self, requirement: &str) -> WheelhouseResult<PackageMetadata> {
        let requirement = PackageRequirement::parse(requirement)?;
        self.source.fetch(&requirement).await
    }

    /// Resolve requirement strings, following dependencies when the
    /// settings ask for it
    pub fn resolve(&self, requirements: Vec<String>) -> ResolutionStream {
        self.resolver.resolve(
            requirements,
            self.environment(),
            self.settings.include_dependencies,
        )
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Replace the download queue with one job per staged package.
    ///
    /// Packages without a compatible wheel are skipped (the manager emits
    /// [`CoreEvent::NoCompatibleArtifact`] for them).
    pub async fn download_all(&self, staging: &StagingArea) -> WheelhouseResult<Vec<Uuid>> {
        let output_dir = &self.settings.output_dir;
        tokio::fs::create_dir_all(output_dir).await?;

        self.downloads.reset();

        let target = self.target();
        let mut ids = Vec::with_capacity(staging.len());
        for package in staging.packages() {
            if let Some(id) = self
                .downloads
                .enqueue_package(package, &target, output_dir)
                .await?
            {
                ids.push(id);
            }
        }

        info!(
            "Queued {} of {} staged packages into {}",
            ids.len(),
            staging.len(),
            output_dir.display()
        );
        Ok(ids)
    }

    /// Summary of the output directory for the staged root packages
    pub async fn transfer_summary(&self, staging: &StagingArea) -> WheelhouseResult<TransferSummary> {
        TransferSummary::scan(&self.settings.output_dir, &staging.root_names()).await
    }
}
