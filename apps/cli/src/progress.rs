//! Progress bar utilities for CLI downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;
use wheelhouse_types::{CoreEvent, JobState, JobStatus};

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:32!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ")
    }

    /// Bar for a job, created on first sight
    fn bar_for(&mut self, state: &JobState) -> ProgressBar {
        if let Some(pb) = self.bars.get(&state.id) {
            return pb.clone();
        }

        let pb = self.multi.add(ProgressBar::new(state.total));
        pb.set_style(Self::bar_style());
        pb.set_message(state.filename.clone());
        self.bars.insert(state.id, pb.clone());
        pb
    }

    /// Update the bars from an event
    pub fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::JobProgress { state } => {
                let pb = self.bar_for(state);
                if state.status == JobStatus::Queued && pb.is_finished() {
                    // Retried after failing
                    pb.reset();
                    pb.set_message(state.filename.clone());
                }
                if state.total > 0 {
                    pb.set_length(state.total);
                }
                pb.set_position(state.transferred);

                match state.status {
                    JobStatus::Completed => {
                        pb.finish_with_message(format!(
                            "{} {}",
                            style("✓").green().bold(),
                            state.filename
                        ));
                    }
                    JobStatus::Failed => {
                        pb.abandon_with_message(format!(
                            "{} {}: {}",
                            style("✗").red().bold(),
                            state.filename,
                            state.error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                    JobStatus::Cancelled => {
                        pb.abandon_with_message(format!(
                            "{} {} cancelled",
                            style("○").dim(),
                            state.filename
                        ));
                    }
                    JobStatus::Queued | JobStatus::Downloading => {}
                }
            }

            CoreEvent::NoCompatibleArtifact { name, version } => {
                let _ = self.multi.println(format!(
                    "{} No compatible wheel for {} {}",
                    style("!").yellow().bold(),
                    name,
                    version
                ));
            }

            CoreEvent::QueueReset => self.clear(),
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Spinner shown while a resolution runs
pub fn resolve_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
