//! Summary of a finished download directory, for moving it to an offline
//! machine

use crate::error::WheelhouseResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A wheel sitting in the output directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelFile {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub output_dir: PathBuf,
    /// Sorted by filename
    pub files: Vec<WheelFile>,
    pub total_size: u64,
    /// Offline install command for the target machine
    pub install_command: String,
}

impl TransferSummary {
    /// List the wheels in `output_dir` and build the install command for
    /// `root_names`. Without root names, names are taken from the wheel
    /// filenames.
    pub async fn scan(output_dir: &Path, root_names: &[String]) -> WheelhouseResult<Self> {
        let mut files = Vec::new();

        if fs::metadata(output_dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            let mut entries = fs::read_dir(output_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let filename = entry.file_name().to_string_lossy().into_owned();
                if !filename.ends_with(".whl") {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    files.push(WheelFile {
                        filename,
                        size: meta.len(),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));

        let total_size = files.iter().map(|f| f.size).sum();

        let names: BTreeSet<String> = if root_names.is_empty() {
            files
                .iter()
                .filter_map(|f| f.filename.split('-').next())
                .map(|name| name.replace('_', "-"))
                .collect()
        } else {
            root_names.iter().cloned().collect()
        };

        let mut install_command = format!(
            "pip install --no-index --find-links \"{}\"",
            output_dir.display()
        );
        for name in &names {
            install_command.push(' ');
            install_command.push_str(name);
        }

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            files,
            total_size,
            install_command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_lists_wheels_and_builds_command() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("requests-2.31.0-py3-none-any.whl"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("charset_normalizer-3.3.0-py3-none-any.whl"), vec![0u8; 50])
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let roots = vec!["requests".to_string(), "flask".to_string()];
        let summary = TransferSummary::scan(dir.path(), &roots).await.unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(
            summary.files[0].filename,
            "charset_normalizer-3.3.0-py3-none-any.whl"
        );
        assert_eq!(summary.total_size, 150);
        assert_eq!(
            summary.install_command,
            format!(
                "pip install --no-index --find-links \"{}\" flask requests",
                dir.path().display()
            )
        );
    }

    #[tokio::test]
    async fn test_scan_derives_names_from_wheels() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("charset_normalizer-3.3.0-py3-none-any.whl"), b"x").unwrap();
        std::fs::write(dir.path().join("idna-3.4-py3-none-any.whl"), b"x").unwrap();

        let summary = TransferSummary::scan(dir.path(), &[]).await.unwrap();
        assert!(summary
            .install_command
            .ends_with("charset-normalizer idna"));
    }

    #[tokio::test]
    async fn test_scan_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let summary = TransferSummary::scan(&missing, &[]).await.unwrap();
        assert!(summary.files.is_empty());
        assert_eq!(summary.total_size, 0);
    }
}
