//! CLI command implementations

use crate::output::{format_bytes, truncate};
use crate::progress::{resolve_spinner, DownloadProgress};
use crate::{ConfigAction, OutputFormat, RequirementArgs, TargetArgs};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;
use wheelhouse_core::{
    get_setting, parse_requirements_file, set_setting, setting_keys, validate, SettingsStore,
    StagingArea, TransferSummary, WheelhouseCore,
};
use wheelhouse_types::{CoreEvent, JobState, JobStatus, ResolveEvent, Settings};

// ============================================================================
// Shared helpers
// ============================================================================

/// Stored settings with the command line overrides applied
async fn load_settings(store: &SettingsStore, target: &TargetArgs) -> Result<Settings> {
    let mut settings = store.load().await?;
    target.apply(&mut settings);
    Ok(settings)
}

/// Requirement strings from the arguments followed by those of each
/// requirements file
async fn collect_requirements(args: &RequirementArgs) -> Result<Vec<String>> {
    let mut requirements = args.packages.clone();

    for path in &args.requirements {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read requirements file {}", path.display()))?;
        requirements.extend(parse_requirements_file(&content));
    }

    if requirements.is_empty() {
        bail!("No packages given (pass names or -r <file>)");
    }
    Ok(requirements)
}

#[derive(Debug, Serialize)]
struct Problem {
    name: String,
    reason: String,
}

/// Everything one resolution run produced
#[derive(Default)]
struct Resolution {
    staging: StagingArea,
    not_found: Vec<Problem>,
    skipped: Vec<Problem>,
}

async fn run_resolution(core: &WheelhouseCore, requirements: Vec<String>) -> Result<Resolution> {
    let spinner = resolve_spinner();
    let mut resolution = Resolution::default();
    let mut events = core.resolve(requirements);

    while let Some(event) = events.next().await {
        match event {
            ResolveEvent::Status { message } => spinner.set_message(message),
            ResolveEvent::Staged { ref package } => {
                spinner.set_message(format!("Resolved {} {}", package.name(), package.version()));
                resolution.staging.apply(&event);
            }
            ResolveEvent::NotFound { name, reason } => {
                spinner.println(format!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    style(&name).yellow(),
                    reason
                ));
                resolution.not_found.push(Problem { name, reason });
            }
            ResolveEvent::DependencySkipped {
                requirement,
                reason,
            } => {
                spinner.println(format!(
                    "{} Skipped dependency {}: {}",
                    style("!").yellow().bold(),
                    requirement,
                    reason
                ));
                resolution.skipped.push(Problem {
                    name: requirement,
                    reason,
                });
            }
            ResolveEvent::IndexUnreachable { reason } => {
                spinner.finish_and_clear();
                bail!("Package index unreachable: {}", reason);
            }
            ResolveEvent::Complete { staged, missing } => {
                debug!("Resolution complete: {} staged, {} missing", staged, missing);
            }
        }
    }

    spinner.finish_and_clear();
    Ok(resolution)
}

fn print_staging(staging: &StagingArea) {
    if staging.is_empty() {
        println!("{}", style("No packages staged").dim());
        return;
    }

    for package in staging.packages() {
        let marker = if package.is_dependency {
            style("dependency").dim().to_string()
        } else {
            style("requested").cyan().to_string()
        };
        println!(
            "  {} {} ({})",
            style(package.name()).bold(),
            package.version(),
            marker
        );
    }
    println!();
    println!("{}", style(staging.summary()).bold());
}

fn print_staging_table(staging: &StagingArea) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct PackageRow {
        name: String,
        version: String,
        kind: String,
        wheels: usize,
        summary: String,
    }

    let rows: Vec<PackageRow> = staging
        .packages()
        .iter()
        .map(|p| PackageRow {
            name: p.name().to_string(),
            version: p.version().to_string(),
            kind: if p.is_dependency { "dependency" } else { "requested" }.to_string(),
            wheels: p.metadata.wheel_count(),
            summary: truncate(&p.metadata.description, 40),
        })
        .collect();

    println!("{}", Table::new(rows));
}

// ============================================================================
// Search
// ============================================================================

pub async fn search(
    store: &SettingsStore,
    package: &str,
    target: &TargetArgs,
    format: OutputFormat,
) -> Result<()> {
    let core = WheelhouseCore::new(load_settings(store, target).await?)?;
    let metadata = core.lookup(package).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct FieldRow {
                field: &'static str,
                value: String,
            }

            let rows = vec![
                FieldRow { field: "name", value: metadata.name.clone() },
                FieldRow { field: "version", value: metadata.version.clone() },
                FieldRow { field: "summary", value: truncate(&metadata.description, 60) },
                FieldRow { field: "author", value: metadata.author.clone() },
                FieldRow { field: "license", value: truncate(&metadata.license, 60) },
                FieldRow { field: "dependencies", value: metadata.dependencies.len().to_string() },
                FieldRow { field: "wheels", value: metadata.wheel_count().to_string() },
            ];
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            println!(
                "{} {}",
                style(&metadata.name).cyan().bold(),
                style(&metadata.version).bold()
            );
            if !metadata.description.is_empty() {
                println!("  {}", metadata.description);
            }
            println!();
            println!("  Author:       {}", metadata.author);
            println!("  License:      {}", truncate(&metadata.license, 60));
            println!("  Dependencies: {}", metadata.dependencies.len());
            for dependency in &metadata.dependencies {
                println!("    {}", style(dependency).dim());
            }
            println!(
                "  Files:        {} ({} wheels)",
                metadata.artifacts.len(),
                metadata.wheel_count()
            );
        }
    }

    Ok(())
}

// ============================================================================
// Resolve
// ============================================================================

pub async fn resolve(
    store: &SettingsStore,
    requirements: &RequirementArgs,
    target: &TargetArgs,
    format: OutputFormat,
) -> Result<()> {
    let core = WheelhouseCore::new(load_settings(store, target).await?)?;
    let resolution = run_resolution(&core, collect_requirements(requirements).await?).await?;

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "target": core.target(),
                "packages": resolution.staging.packages(),
                "not_found": resolution.not_found,
                "skipped": resolution.skipped,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => print_staging_table(&resolution.staging),
        OutputFormat::Human => {
            let target = core.target();
            println!(
                "Resolved for Python {} on {}:",
                style(&target.python_version).bold(),
                style(&target.platform).bold()
            );
            println!();
            print_staging(&resolution.staging);
        }
    }

    Ok(())
}

// ============================================================================
// Download
// ============================================================================

#[derive(Serialize)]
struct DownloadReport<'a> {
    jobs: &'a [JobState],
    not_found: &'a [Problem],
    summary: &'a TransferSummary,
}

pub async fn download(
    store: &SettingsStore,
    requirements: &RequirementArgs,
    target: &TargetArgs,
    dest: Option<PathBuf>,
    jobs: Option<usize>,
    retries: u32,
    format: OutputFormat,
) -> Result<()> {
    let mut settings = load_settings(store, target).await?;
    if let Some(dest) = dest {
        settings.output_dir = dest;
    }
    if let Some(jobs) = jobs {
        settings.max_concurrent_downloads = jobs;
    }
    validate(&settings)?;

    let core = WheelhouseCore::new(settings)?;
    let resolution = run_resolution(&core, collect_requirements(requirements).await?).await?;

    if resolution.staging.is_empty() {
        bail!("Nothing to download");
    }
    if !matches!(format, OutputFormat::Json) {
        println!("{}", style(resolution.staging.summary()).bold());
    }

    // Subscribe before queueing so no event is missed
    let mut events = core.subscribe();
    let ids = core.download_all(&resolution.staging).await?;
    debug!("Queued {} downloads", ids.len());

    let downloads = core.downloads().clone();
    let mut progress = DownloadProgress::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut round = 0;

    loop {
        while !downloads.aggregate().is_settled() {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => progress.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Progress display skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    eprintln!("{} Cancelling downloads...", style("!").yellow().bold());
                    for state in downloads.snapshot_all() {
                        if !state.status.is_finished() {
                            let _ = downloads.cancel(state.id);
                        }
                    }
                }
            }
        }

        if interrupted || round >= retries {
            break;
        }
        let transient = retry_candidates(&downloads.snapshot_all());
        if transient.is_empty() {
            break;
        }
        round += 1;
        eprintln!(
            "{} Retrying {} download(s) ({}/{})",
            style("↻").yellow().bold(),
            transient.len(),
            round,
            retries
        );
        for id in transient {
            downloads.retry(id)?;
        }
    }

    // Events still buffered, then the final state of every bar
    while let Ok(event) = events.try_recv() {
        progress.handle_event(&event);
    }
    let states = downloads.snapshot_all();
    for state in &states {
        progress.handle_event(&CoreEvent::JobProgress {
            state: state.clone(),
        });
    }

    let aggregate = downloads.aggregate();
    let summary = core.transfer_summary(&resolution.staging).await?;

    match format {
        OutputFormat::Json => {
            let report = DownloadReport {
                jobs: &states,
                not_found: &resolution.not_found,
                summary: &summary,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!();
            println!(
                "{} {} downloaded, {} failed, {} cancelled",
                style("Done:").bold(),
                style(aggregate.completed).green(),
                style(aggregate.failed).red(),
                aggregate.cancelled
            );
            println!(
                "  {} wheel(s), {} in {}",
                summary.files.len(),
                format_bytes(summary.total_size),
                summary.output_dir.display()
            );
            println!();
            println!("Install on the offline machine with:");
            println!("  {}", style(&summary.install_command).cyan());
        }
    }

    if interrupted {
        bail!("Interrupted");
    }
    if aggregate.failed > 0 {
        let failed: Vec<&str> = states
            .iter()
            .filter(|s| s.status == JobStatus::Failed)
            .map(|s| s.filename.as_str())
            .collect();
        return Err(anyhow!(
            "{} download(s) failed: {}",
            failed.len(),
            failed.join(", ")
        ));
    }

    Ok(())
}

/// Failed jobs whose error is worth another attempt
fn retry_candidates(states: &[JobState]) -> Vec<Uuid> {
    states
        .iter()
        .filter(|s| s.status == JobStatus::Failed && s.retryable)
        .map(|s| s.id)
        .collect()
}

// ============================================================================
// Config Commands
// ============================================================================

/// Setting value without JSON quoting for plain strings
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn config_action(
    store: &SettingsStore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = store.load().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("Wheelhouse Configuration ({}):", store.path().display());
                    println!();
                    for key in setting_keys() {
                        let value = get_setting(&settings, &key)?;
                        println!("  {:<26} {}", key, display_value(&value));
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = store.load().await?;
            let value = get_setting(&settings, &key)?;
            match format {
                OutputFormat::Json => println!("{}", value),
                _ => println!("{}", display_value(&value)),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = store.load().await?;
            let updated = set_setting(&settings, &key, &value)?;
            store.save(&updated).await?;
            println!(
                "{} {} = {}",
                style("✓").green().bold(),
                key,
                display_value(&get_setting(&updated, &key)?)
            );
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                store.reset().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_requirements_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("requirements.txt");
        tokio::fs::write(&file, "# pinned\nflask==3.0.0\n\n-e .\nclick>=8 # cli\n")
            .await
            .unwrap();

        let args = RequirementArgs {
            packages: vec!["requests".to_string()],
            requirements: vec![file],
        };
        let requirements = collect_requirements(&args).await.unwrap();
        assert_eq!(requirements, vec!["requests", "flask==3.0.0", "click>=8"]);
    }

    #[tokio::test]
    async fn test_collect_requirements_rejects_empty() {
        let args = RequirementArgs {
            packages: Vec::new(),
            requirements: Vec::new(),
        };
        assert!(collect_requirements(&args).await.is_err());
    }

    #[test]
    fn test_retry_candidates_skip_permanent_failures() {
        let state = |status, retryable| JobState {
            id: Uuid::new_v4(),
            package_name: "pkg".into(),
            version: "1.0".into(),
            is_dependency: false,
            filename: "pkg-1.0-py3-none-any.whl".into(),
            url: "https://files.example/pkg-1.0-py3-none-any.whl".into(),
            destination: PathBuf::from("pkg-1.0-py3-none-any.whl"),
            status,
            transferred: 0,
            total: 0,
            speed: 0,
            eta: None,
            error: None,
            retryable,
            started_at: None,
            finished_at: None,
        };
        let states = vec![
            state(JobStatus::Failed, true),
            state(JobStatus::Failed, false),
            state(JobStatus::Cancelled, true),
            state(JobStatus::Completed, false),
        ];

        assert_eq!(retry_candidates(&states), vec![states[0].id]);
    }

    #[test]
    fn test_display_value_unquotes_strings() {
        assert_eq!(display_value(&serde_json::json!("3.11")), "3.11");
        assert_eq!(display_value(&serde_json::json!(5)), "5");
        assert_eq!(display_value(&serde_json::json!(true)), "true");
    }
}
