//! Shared types for Wheelhouse
//!
//! This crate contains the data structures shared between the core
//! engine and the CLI: package metadata, resolution results, download
//! job snapshots, settings and the events the core emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Package Types
// ============================================================================

/// Kind of a file listed for a release on the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Prebuilt, tag-annotated wheel. The only kind that gets downloaded.
    BinaryWheel,
    /// Source archive that would need a local build
    SourceArchive,
    Other,
}

impl ArtifactKind {
    /// Map the index's `packagetype` field to a kind
    pub fn from_package_type(packagetype: &str) -> Self {
        match packagetype {
            "bdist_wheel" => ArtifactKind::BinaryWheel,
            "sdist" => ArtifactKind::SourceArchive,
            _ => ArtifactKind::Other,
        }
    }
}

/// A downloadable file of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub filename: String,
    pub url: String,
    pub kind: ArtifactKind,
}

impl ArtifactDescriptor {
    pub fn new(filename: impl Into<String>, url: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
            kind,
        }
    }

    /// Shorthand for a binary wheel descriptor
    pub fn wheel(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(filename, url, ArtifactKind::BinaryWheel)
    }

    pub fn is_wheel(&self) -> bool {
        self.kind == ArtifactKind::BinaryWheel
    }
}

/// Normalized metadata of one release of a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub license: String,
    /// Raw dependency requirement strings, in index order
    pub dependencies: Vec<String>,
    /// Files published for this version, in index order
    pub artifacts: Vec<ArtifactDescriptor>,
}

impl PackageMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: "N/A".to_string(),
            license: "N/A".to_string(),
            dependencies: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Number of binary wheels among the artifacts
    pub fn wheel_count(&self) -> usize {
        self.artifacts.iter().filter(|a| a.is_wheel()).count()
    }
}

/// A package produced by one resolution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub metadata: PackageMetadata,
    /// False only for packages the caller asked for directly
    pub is_dependency: bool,
    /// Normalized name used for deduplication
    pub key: String,
}

impl ResolvedPackage {
    pub fn new(metadata: PackageMetadata, is_dependency: bool, key: impl Into<String>) -> Self {
        Self {
            metadata,
            is_dependency,
            key: key.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }
}

/// Runtime/platform pair that artifacts are selected for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Interpreter version, e.g. "3.11" or "3.11.4"
    pub python_version: String,
    /// Platform tag, e.g. "win_amd64", or "any" for no particular platform
    pub platform: String,
}

impl Target {
    pub const ANY_PLATFORM: &'static str = "any";

    pub fn new(python_version: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            python_version: python_version.into(),
            platform: platform.into(),
        }
    }

    pub fn is_any_platform(&self) -> bool {
        self.platform == Self::ANY_PLATFORM
    }
}

// ============================================================================
// Download Job Types
// ============================================================================

/// Status of a download job
///
/// `Queued -> Downloading -> {Completed | Failed | Cancelled}`, with
/// `Failed`/`Cancelled -> Queued` on retry. A job whose file already exists
/// goes `Queued -> Completed` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Completed)
                | (Queued, Cancelled)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Failed, Queued)
                | (Cancelled, Queued)
        )
    }

    /// No worker is or will be executing the job
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_retry(self) -> bool {
        self.can_transition_to(JobStatus::Queued)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Downloading => "Downloading",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a download job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: Uuid,
    pub package_name: String,
    pub version: String,
    pub is_dependency: bool,
    pub filename: String,
    pub url: String,
    pub destination: PathBuf,
    pub status: JobStatus,
    /// Bytes written to the destination so far
    pub transferred: u64,
    /// Declared size, 0 while unknown
    pub total: u64,
    /// Bytes per second since the transfer started
    pub speed: u64,
    /// Seconds remaining, when both speed and size are known
    pub eta: Option<u64>,
    pub error: Option<String>,
    /// The last failure was transient (network, timeout, 5xx)
    #[serde(default)]
    pub retryable: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn progress(&self) -> f64 {
        if self.total > 0 {
            (self.transferred as f64 / self.total as f64) * 100.0
        } else if self.status == JobStatus::Completed {
            100.0
        } else {
            0.0
        }
    }
}

/// Totals over a set of job snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateProgress {
    pub jobs: usize,
    pub queued: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub transferred: u64,
    pub total: u64,
    /// Summed speed of the jobs currently downloading
    pub speed: u64,
}

impl AggregateProgress {
    pub fn from_states(states: &[JobState]) -> Self {
        let mut agg = Self {
            jobs: states.len(),
            ..Self::default()
        };

        for state in states {
            match state.status {
                JobStatus::Queued => agg.queued += 1,
                JobStatus::Downloading => {
                    agg.downloading += 1;
                    agg.speed += state.speed;
                }
                JobStatus::Completed => agg.completed += 1,
                JobStatus::Failed => agg.failed += 1,
                JobStatus::Cancelled => agg.cancelled += 1,
            }
            agg.transferred += state.transferred;
            agg.total += state.total;
        }

        agg
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.transferred as f64 / self.total as f64) * 100.0
    }

    /// Every job has reached a finished status
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.downloading == 0
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Package index base, either the `/simple/` or the `/pypi/` form
    pub index_url: String,
    /// Timeout for metadata requests
    pub request_timeout_secs: u64,
    /// Timeout for a single artifact transfer
    pub download_timeout_secs: u64,
    pub max_concurrent_downloads: usize,
    pub output_dir: PathBuf,
    pub include_dependencies: bool,
    pub python_version: String,
    pub platform: String,
}

impl Settings {
    pub fn target(&self) -> Target {
        Target::new(self.python_version.clone(), self.platform.clone())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            index_url: "https://pypi.org/simple/".to_string(),
            request_timeout_secs: 10,
            download_timeout_secs: 30,
            max_concurrent_downloads: 5,
            output_dir: dirs::download_dir()
                .map(|p| p.join("pip-packages"))
                .unwrap_or_else(|| PathBuf::from("pip-packages")),
            include_dependencies: true,
            python_version: "3.11".to_string(),
            platform: Target::ANY_PLATFORM.to_string(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events produced by one resolution run, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ResolveEvent {
    Status {
        message: String,
    },
    Staged {
        package: ResolvedPackage,
    },
    NotFound {
        name: String,
        reason: String,
    },
    /// A dependency string was dropped because it could not be parsed
    DependencySkipped {
        requirement: String,
        reason: String,
    },
    /// The index could not be reached at all; the run ends after this
    IndexUnreachable {
        reason: String,
    },
    /// Always the last event of a run
    Complete {
        staged: usize,
        missing: usize,
    },
}

/// Events emitted by the download manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    JobProgress {
        state: JobState,
    },
    /// Metadata resolved but no wheel fits the target
    NoCompatibleArtifact {
        name: String,
        version: String,
    },
    QueueReset,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: JobStatus, transferred: u64, total: u64, speed: u64) -> JobState {
        JobState {
            id: Uuid::new_v4(),
            package_name: "pkg".into(),
            version: "1.0".into(),
            is_dependency: false,
            filename: "pkg-1.0-py3-none-any.whl".into(),
            url: "https://example.com/pkg.whl".into(),
            destination: PathBuf::from("/tmp/pkg.whl"),
            status,
            transferred,
            total,
            speed,
            eta: None,
            error: None,
            retryable: false,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Cancelled));
        assert!(Failed.can_retry());
        assert!(Cancelled.can_retry());
        assert!(!Completed.can_retry());
        assert!(!Downloading.can_retry());
        assert!(!Completed.can_transition_to(Downloading));
        assert!(!Queued.can_transition_to(Failed));
    }

    #[test]
    fn test_aggregate_progress() {
        let states = vec![
            state(JobStatus::Downloading, 50, 100, 10),
            state(JobStatus::Downloading, 10, 100, 5),
            state(JobStatus::Completed, 200, 200, 40),
            state(JobStatus::Failed, 3, 0, 0),
            state(JobStatus::Queued, 0, 0, 0),
        ];

        let agg = AggregateProgress::from_states(&states);
        assert_eq!(agg.jobs, 5);
        assert_eq!(agg.downloading, 2);
        assert_eq!(agg.completed, 1);
        assert_eq!(agg.failed, 1);
        assert_eq!(agg.queued, 1);
        assert_eq!(agg.transferred, 263);
        assert_eq!(agg.total, 400);
        // only downloading jobs count towards speed
        assert_eq!(agg.speed, 15);
        assert!(!agg.is_settled());
    }

    #[test]
    fn test_settings_fill_missing_keys() {
        let settings: Settings =
            serde_json::from_str(r#"{"platform": "win_amd64", "max_concurrent_downloads": 2}"#)
                .unwrap();
        assert_eq!(settings.platform, "win_amd64");
        assert_eq!(settings.max_concurrent_downloads, 2);
        assert_eq!(settings.python_version, "3.11");
        assert!(settings.include_dependencies);
        assert_eq!(settings.index_url, "https://pypi.org/simple/");
    }

    #[test]
    fn test_artifact_kind_mapping() {
        assert_eq!(ArtifactKind::from_package_type("bdist_wheel"), ArtifactKind::BinaryWheel);
        assert_eq!(ArtifactKind::from_package_type("sdist"), ArtifactKind::SourceArchive);
        assert_eq!(ArtifactKind::from_package_type("bdist_egg"), ArtifactKind::Other);
    }
}
