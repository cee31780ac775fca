//! Dependency resolver
//!
//! Breadth-first walk over the dependency graph. Each normalized name is
//! looked up at most once per run; the first version found is kept and
//! never revisited. Results are delivered as an ordered event stream from a
//! background task.

use crate::index::MetadataSource;
use crate::requirement::{MarkerEnvironment, PackageRequirement};
use futures::Stream;
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use wheelhouse_types::{ResolveEvent, ResolvedPackage};

/// Resolves requirement strings into packages via a [`MetadataSource`]
#[derive(Clone)]
pub struct Resolver {
    source: Arc<dyn MetadataSource>,
}

impl Resolver {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { source }
    }

    /// Start a resolution run on a background task.
    ///
    /// The returned stream always ends with [`ResolveEvent::Complete`].
    /// Dropping it stops the run at its next event.
    pub fn resolve(
        &self,
        requirements: Vec<String>,
        environment: MarkerEnvironment,
        include_transitive: bool,
    ) -> ResolutionStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let roots = requirements
            .iter()
            .filter_map(|raw| PackageRequirement::parse(raw).ok())
            .map(|req| req.key())
            .collect();

        let run = ResolutionRun {
            source: self.source.clone(),
            environment,
            include_transitive,
            tx,
            queue: requirements.into_iter().collect(),
            processed: HashSet::new(),
            roots,
            staged: 0,
            missing: 0,
            reached_index: false,
        };
        tokio::spawn(run.run());

        ResolutionStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

/// Ordered events of one resolution run
pub struct ResolutionStream {
    inner: UnboundedReceiverStream<ResolveEvent>,
}

impl Stream for ResolutionStream {
    type Item = ResolveEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// The consumer went away
struct Closed;

struct ResolutionRun {
    source: Arc<dyn MetadataSource>,
    environment: MarkerEnvironment,
    include_transitive: bool,
    tx: mpsc::UnboundedSender<ResolveEvent>,
    queue: VecDeque<String>,
    /// Normalized names already looked up, successfully or not
    processed: HashSet<String>,
    /// Normalized names the caller asked for
    roots: HashSet<String>,
    staged: usize,
    missing: usize,
    /// At least one lookup got an answer from the index
    reached_index: bool,
}

impl ResolutionRun {
    async fn run(mut self) {
        if self.drive().await.is_err() {
            debug!("Resolution stream dropped, stopping");
        }
    }

    fn emit(&self, event: ResolveEvent) -> Result<(), Closed> {
        self.tx.send(event).map_err(|_| Closed)
    }

    fn status(&self, message: String) -> Result<(), Closed> {
        self.emit(ResolveEvent::Status { message })
    }

    async fn drive(&mut self) -> Result<(), Closed> {
        info!("Resolving {} requirement(s)", self.queue.len());
        self.status(format!("Resolving {} requirement(s)...", self.queue.len()))?;

        while let Some(raw) = self.queue.pop_front() {
            let requirement = match PackageRequirement::parse(&raw) {
                Ok(requirement) => requirement,
                Err(e) => {
                    warn!("Skipping requirement '{}': {}", raw, e);
                    self.missing += 1;
                    self.emit(ResolveEvent::NotFound {
                        name: raw,
                        reason: e.to_string(),
                    })?;
                    continue;
                }
            };

            let key = requirement.key();
            if !self.processed.insert(key.clone()) {
                debug!("{} already processed", key);
                continue;
            }

            self.status(format!("Fetching metadata for {}...", requirement))?;

            match self.source.fetch(&requirement).await {
                Ok(metadata) => {
                    self.reached_index = true;
                    let dependencies = if self.include_transitive {
                        metadata.dependencies.clone()
                    } else {
                        Vec::new()
                    };

                    let is_dependency = !self.roots.contains(&key);
                    info!(
                        "Staged {} {}{}",
                        metadata.name,
                        metadata.version,
                        if is_dependency { " (dependency)" } else { "" }
                    );
                    self.staged += 1;
                    self.emit(ResolveEvent::Staged {
                        package: ResolvedPackage::new(metadata, is_dependency, key),
                    })?;

                    for dependency in dependencies {
                        self.queue_dependency(dependency)?;
                    }
                }
                Err(e) if e.is_unreachable() && !self.reached_index => {
                    error!("Package index unreachable: {}", e);
                    self.emit(ResolveEvent::IndexUnreachable {
                        reason: e.to_string(),
                    })?;
                    break;
                }
                Err(e) => {
                    warn!("Lookup of {} failed: {}", requirement.name, e);
                    self.missing += 1;
                    self.emit(ResolveEvent::NotFound {
                        name: requirement.name.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }

        self.emit(ResolveEvent::Complete {
            staged: self.staged,
            missing: self.missing,
        })
    }

    /// Queue a dependency by name, unless its marker rules it out or the
    /// name was already looked up
    fn queue_dependency(&mut self, raw: String) -> Result<(), Closed> {
        let requirement = match PackageRequirement::parse(&raw) {
            Ok(requirement) => requirement,
            Err(e) => {
                warn!("Dropping dependency '{}': {}", raw, e);
                return self.emit(ResolveEvent::DependencySkipped {
                    requirement: raw,
                    reason: e.to_string(),
                });
            }
        };

        if !requirement.applies_to(&self.environment) {
            debug!("Marker excludes dependency '{}'", raw);
            return Ok(());
        }
        if self.processed.contains(&requirement.key()) {
            return Ok(());
        }

        self.queue.push_back(requirement.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{WheelhouseError, WheelhouseResult};
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use wheelhouse_types::{PackageMetadata, Target};

    /// In-memory index keyed by normalized name
    #[derive(Default)]
    struct FakeIndex {
        packages: HashMap<String, PackageMetadata>,
        unreachable: bool,
        lookups: Mutex<Vec<String>>,
    }

    impl FakeIndex {
        fn with(mut self, name: &str, dependencies: &[&str]) -> Self {
            let mut metadata = PackageMetadata::new(name, "1.0.0");
            metadata.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
            self.packages
                .insert(crate::requirement::normalize_name(name), metadata);
            self
        }

        fn lookups(&self) -> Vec<String> {
            self.lookups.lock().clone()
        }
    }

    #[async_trait]
    impl MetadataSource for FakeIndex {
        async fn fetch(&self, requirement: &PackageRequirement) -> WheelhouseResult<PackageMetadata> {
            self.lookups.lock().push(requirement.key());
            if self.unreachable {
                return Err(WheelhouseError::IndexUnreachable("connection refused".into()));
            }
            self.packages
                .get(&requirement.key())
                .cloned()
                .ok_or_else(|| WheelhouseError::PackageNotFound(requirement.name.clone()))
        }
    }

    fn linux() -> MarkerEnvironment {
        MarkerEnvironment::from_target(&Target::new("3.11", "linux"))
    }

    async fn run(index: Arc<FakeIndex>, roots: &[&str], transitive: bool) -> Vec<ResolveEvent> {
        let resolver = Resolver::new(index);
        resolver
            .resolve(roots.iter().map(|r| r.to_string()).collect(), linux(), transitive)
            .collect()
            .await
    }

    fn staged(events: &[ResolveEvent]) -> Vec<(String, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                ResolveEvent::Staged { package } => {
                    Some((package.name().to_string(), package.is_dependency))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_name_variants_resolved_once() {
        let index = Arc::new(FakeIndex::default().with("foo-bar", &[]));
        let events = run(index.clone(), &["Foo_Bar", "foo-bar", "FOO.bar"], true).await;

        assert_eq!(staged(&events), vec![("foo-bar".to_string(), false)]);
        assert_eq!(index.lookups(), vec!["foo-bar"]);
        assert_eq!(
            events.last(),
            Some(&ResolveEvent::Complete {
                staged: 1,
                missing: 0
            })
        );
    }

    #[tokio::test]
    async fn test_diamond_dependency_staged_once() {
        let index = Arc::new(
            FakeIndex::default()
                .with("A", &["B", "C>=1.0"])
                .with("B", &["C"])
                .with("C", &[]),
        );
        let events = run(index.clone(), &["A"], true).await;

        assert_eq!(
            staged(&events),
            vec![
                ("A".to_string(), false),
                ("B".to_string(), true),
                ("C".to_string(), true),
            ]
        );
        assert_eq!(index.lookups(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_false_marker_never_queued() {
        let index = Arc::new(
            FakeIndex::default()
                .with(
                    "A",
                    &[
                        "winonly; sys_platform == 'win32'",
                        "socks-helper; extra == 'socks'",
                        "linuxonly; sys_platform == 'linux'",
                    ],
                )
                .with("winonly", &[])
                .with("socks-helper", &[])
                .with("linuxonly", &[]),
        );
        let events = run(index.clone(), &["A"], true).await;

        assert_eq!(index.lookups(), vec!["a", "linuxonly"]);
        assert_eq!(staged(&events).len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_does_not_abort() {
        let index = Arc::new(FakeIndex::default().with("A", &["ghost"]));
        let events = run(index, &["missing", "A"], true).await;

        let not_found: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ResolveEvent::NotFound { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(not_found, vec!["missing", "ghost"]);
        assert_eq!(staged(&events), vec![("A".to_string(), false)]);
        assert_eq!(
            events.last(),
            Some(&ResolveEvent::Complete {
                staged: 1,
                missing: 2
            })
        );
    }

    #[tokio::test]
    async fn test_unparsable_dependency_skipped_with_warning() {
        let index = Arc::new(
            FakeIndex::default()
                .with("A", &["!!not a requirement", "B"])
                .with("B", &[]),
        );
        let events = run(index, &["A"], true).await;

        assert!(events.iter().any(|e| matches!(
            e,
            ResolveEvent::DependencySkipped { requirement, .. } if requirement == "!!not a requirement"
        )));
        assert_eq!(staged(&events).len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_index_surfaced_once() {
        let index = Arc::new(FakeIndex {
            unreachable: true,
            ..FakeIndex::default()
        });
        let events = run(index.clone(), &["A", "B", "C"], true).await;

        let unreachable = events
            .iter()
            .filter(|e| matches!(e, ResolveEvent::IndexUnreachable { .. }))
            .count();
        assert_eq!(unreachable, 1);
        assert_eq!(index.lookups(), vec!["a"]);
        assert!(matches!(events.last(), Some(ResolveEvent::Complete { staged: 0, .. })));
    }

    #[tokio::test]
    async fn test_without_transitive() {
        let index = Arc::new(FakeIndex::default().with("A", &["B"]).with("B", &[]));
        let events = run(index.clone(), &["A"], false).await;

        assert_eq!(staged(&events), vec![("A".to_string(), false)]);
        assert_eq!(index.lookups(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_root_pulled_in_as_dependency_stays_root() {
        let index = Arc::new(FakeIndex::default().with("A", &["C"]).with("C", &[]));
        let events = run(index, &["A", "c"], true).await;

        assert_eq!(
            staged(&events),
            vec![("A".to_string(), false), ("C".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let index = Arc::new(FakeIndex::default().with("A", &["B"]).with("B", &["A"]));
        let events = run(index.clone(), &["A"], true).await;

        assert_eq!(staged(&events).len(), 2);
        assert_eq!(index.lookups(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_root_parse_error_reported_as_not_found() {
        let index = Arc::new(FakeIndex::default().with("A", &[]));
        let events = run(index, &["==1.0", "A"], true).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, ResolveEvent::NotFound { name, .. } if name == "==1.0")));
        assert_eq!(staged(&events).len(), 1);
    }
}
