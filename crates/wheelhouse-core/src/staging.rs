//! Staged packages, the consumer side of a resolution run

use crate::requirement::normalize_name;
use wheelhouse_types::{ResolveEvent, ResolvedPackage};

/// Registry of packages waiting to be downloaded, keyed by normalized name.
///
/// Only the task consuming a resolution stream should mutate it.
#[derive(Debug, Clone, Default)]
pub struct StagingArea {
    packages: Vec<ResolvedPackage>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a package. Returns false (and changes nothing) if the name is
    /// already staged.
    pub fn insert(&mut self, package: ResolvedPackage) -> bool {
        if self.contains(&package.key) {
            return false;
        }
        self.packages.push(package);
        true
    }

    /// Apply a resolution event; only `Staged` events change anything
    pub fn apply(&mut self, event: &ResolveEvent) -> bool {
        match event {
            ResolveEvent::Staged { package } => self.insert(package.clone()),
            _ => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ResolvedPackage> {
        let key = normalize_name(name);
        let index = self.packages.iter().position(|p| p.key == key)?;
        Some(self.packages.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        let key = normalize_name(name);
        self.packages.iter().find(|p| p.key == key)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn clear(&mut self) {
        self.packages.clear();
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Packages in staging order
    pub fn packages(&self) -> &[ResolvedPackage] {
        &self.packages
    }

    pub fn root_count(&self) -> usize {
        self.packages.iter().filter(|p| !p.is_dependency).count()
    }

    pub fn dependency_count(&self) -> usize {
        self.packages.iter().filter(|p| p.is_dependency).count()
    }

    /// Names of the packages the user asked for
    pub fn root_names(&self) -> Vec<String> {
        self.packages
            .iter()
            .filter(|p| !p.is_dependency)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// e.g. "2 packages + 3 deps"
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "No packages staged".to_string();
        }

        let roots = self.root_count();
        let mut text = format!("{} package{}", roots, if roots == 1 { "" } else { "s" });
        let deps = self.dependency_count();
        if deps > 0 {
            text.push_str(&format!(" + {} dep{}", deps, if deps == 1 { "" } else { "s" }));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wheelhouse_types::PackageMetadata;

    fn resolved(name: &str, is_dependency: bool) -> ResolvedPackage {
        ResolvedPackage::new(
            PackageMetadata::new(name, "1.0"),
            is_dependency,
            normalize_name(name),
        )
    }

    #[test]
    fn test_insert_is_idempotent_per_name() {
        let mut staging = StagingArea::new();
        assert!(staging.insert(resolved("Foo_Bar", false)));
        assert!(!staging.insert(resolved("foo-bar", true)));
        assert_eq!(staging.len(), 1);
        assert!(!staging.get("FOO-BAR").unwrap().is_dependency);
    }

    #[test]
    fn test_counts_and_summary() {
        let mut staging = StagingArea::new();
        assert_eq!(staging.summary(), "No packages staged");

        staging.insert(resolved("requests", false));
        staging.insert(resolved("flask", false));
        staging.insert(resolved("idna", true));
        staging.insert(resolved("urllib3", true));
        staging.insert(resolved("certifi", true));

        assert_eq!(staging.root_count(), 2);
        assert_eq!(staging.dependency_count(), 3);
        assert_eq!(staging.summary(), "2 packages + 3 deps");
        assert_eq!(staging.root_names(), vec!["requests", "flask"]);
    }

    #[test]
    fn test_remove_and_apply() {
        let mut staging = StagingArea::new();
        let event = ResolveEvent::Staged {
            package: resolved("requests", false),
        };
        assert!(staging.apply(&event));
        assert!(!staging.apply(&ResolveEvent::Status {
            message: "working".into()
        }));

        assert!(staging.remove("Requests").is_some());
        assert!(staging.remove("requests").is_none());
        assert!(staging.is_empty());
    }
}
