//! Metadata client for the package index JSON API
//!
//! Documents live at `{base}/{name}/json` (latest release) and
//! `{base}/{name}/{version}/json` (a specific release).

use crate::error::{WheelhouseError, WheelhouseResult};
use crate::requirement::PackageRequirement;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use wheelhouse_types::{ArtifactDescriptor, ArtifactKind, PackageMetadata, Settings};

/// Something that can answer metadata lookups
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Metadata of the highest release satisfying the requirement's
    /// specifiers, or of the latest release when there are none
    async fn fetch(&self, requirement: &PackageRequirement) -> WheelhouseResult<PackageMetadata>;
}

#[derive(Debug, Deserialize)]
struct IndexDocument {
    info: IndexInfo,
    #[serde(default)]
    releases: HashMap<String, Vec<IndexFile>>,
    #[serde(default)]
    urls: Vec<IndexFile>,
}

#[derive(Debug, Deserialize)]
struct IndexInfo {
    name: String,
    version: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    requires_dist: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct IndexFile {
    filename: String,
    url: String,
    #[serde(default)]
    packagetype: String,
}

impl IndexDocument {
    /// Normalize into metadata for `version`.
    ///
    /// Artifacts come from `releases[version]`, falling back to `urls`
    /// (per-version documents list files only there).
    fn into_metadata(mut self, version: &str) -> PackageMetadata {
        let files = match self.releases.remove(version) {
            Some(files) if !files.is_empty() => files,
            _ => self.urls,
        };

        let or_na = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "N/A".to_string())
        };

        let mut metadata = PackageMetadata::new(self.info.name, version);
        metadata.description = self.info.summary.unwrap_or_default();
        metadata.author = or_na(self.info.author);
        metadata.license = or_na(self.info.license);
        metadata.dependencies = self.info.requires_dist.unwrap_or_default();
        metadata.artifacts = files
            .into_iter()
            .map(|f| {
                ArtifactDescriptor::new(
                    f.filename,
                    f.url,
                    ArtifactKind::from_package_type(&f.packagetype),
                )
            })
            .collect();
        metadata
    }
}

/// HTTP client for the index JSON API
#[derive(Clone)]
pub struct IndexClient {
    client: Client,
    base_url: String,
}

impl IndexClient {
    pub fn new(settings: &Settings) -> WheelhouseResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("wheelhouse/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: api_base(&settings.index_url),
        })
    }

    async fn get_document(&self, url: &str, name: &str) -> WheelhouseResult<IndexDocument> {
        debug!("GET {}", url);

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_connect() {
                WheelhouseError::IndexUnreachable(e.to_string())
            } else {
                WheelhouseError::Network(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WheelhouseError::PackageNotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(WheelhouseError::ServerError {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unexpected status").to_string(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl MetadataSource for IndexClient {
    async fn fetch(&self, requirement: &PackageRequirement) -> WheelhouseResult<PackageMetadata> {
        let name = requirement.key();
        let url = format!("{}/{}/json", self.base_url, name);
        let document = self.get_document(&url, &requirement.name).await?;

        if requirement.specifiers.is_empty() {
            let version = document.info.version.clone();
            info!("Found {} {}", document.info.name, version);
            return Ok(document.into_metadata(&version));
        }

        let chosen = requirement
            .specifiers
            .select_best(document.releases.keys().map(String::as_str))
            .map(str::to_string)
            .ok_or_else(|| WheelhouseError::NoMatchingVersion {
                name: requirement.name.clone(),
                specifier: requirement.specifiers.to_string(),
            })?;

        info!("Found {} {} for {}", document.info.name, chosen, requirement);

        if chosen == document.info.version {
            return Ok(document.into_metadata(&chosen));
        }

        let url = format!("{}/{}/{}/json", self.base_url, name, chosen);
        let pinned = self.get_document(&url, &requirement.name).await?;
        Ok(pinned.into_metadata(&chosen))
    }
}

/// JSON API base for an index URL; a `/simple` suffix becomes `/pypi`
pub fn api_base(index_url: &str) -> String {
    let trimmed = index_url.trim().trim_end_matches('/');
    match trimmed.strip_suffix("/simple") {
        Some(prefix) => format!("{}/pypi", prefix),
        None => trimmed.to_string(),
    }
}
