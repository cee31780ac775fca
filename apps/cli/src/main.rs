//! Wheelhouse CLI - offline package downloader
//!
//! Resolves Python packages against a package index and downloads the
//! wheels for a chosen interpreter/platform, ready to be installed on a
//! machine without network access.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wheelhouse_types::Settings;

/// Wheelhouse - download Python packages for offline install
#[derive(Parser)]
#[command(name = "wheelhouse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Wheelhouse settings
    #[arg(long, env = "WHEELHOUSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Per-invocation overrides of the stored settings
#[derive(Args, Debug, Default)]
struct TargetArgs {
    /// Target Python version (e.g. 3.11)
    #[arg(long)]
    python: Option<String>,

    /// Target platform tag (e.g. win_amd64, manylinux2014_x86_64, any)
    #[arg(long)]
    platform: Option<String>,

    /// Package index URL
    #[arg(long)]
    index_url: Option<String>,

    /// Do not follow dependencies
    #[arg(long)]
    no_deps: bool,
}

impl TargetArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(python) = &self.python {
            settings.python_version = python.clone();
        }
        if let Some(platform) = &self.platform {
            settings.platform = platform.clone();
        }
        if let Some(index_url) = &self.index_url {
            settings.index_url = index_url.clone();
        }
        if self.no_deps {
            settings.include_dependencies = false;
        }
    }
}

/// Packages named on the command line and/or in requirements files
#[derive(Args, Debug)]
struct RequirementArgs {
    /// Requirement strings, e.g. "requests>=2.30"
    packages: Vec<String>,

    /// Read requirements from a file
    #[arg(short, long = "requirement", value_name = "FILE")]
    requirements: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show package information from the index
    Search {
        /// Package name, optionally with a version constraint
        package: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Resolve packages and their dependencies without downloading
    Resolve {
        #[command(flatten)]
        requirements: RequirementArgs,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Resolve and download wheels
    Download {
        #[command(flatten)]
        requirements: RequirementArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Output directory
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Max concurrent downloads
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Rounds of retries for downloads that failed on a transient error
        #[arg(long, default_value_t = 2)]
        retries: u32,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::config_dir()
            .map(|d| d.join("wheelhouse"))
            .unwrap_or_else(|| PathBuf::from(".wheelhouse"))
    });
    let store = wheelhouse_core::SettingsStore::new(data_dir).await?;

    match cli.command {
        Commands::Search { package, target } => {
            commands::search(&store, &package, &target, cli.output).await?
        }

        Commands::Resolve {
            requirements,
            target,
        } => commands::resolve(&store, &requirements, &target, cli.output).await?,

        Commands::Download {
            requirements,
            target,
            dest,
            jobs,
            retries,
        } => {
            commands::download(&store, &requirements, &target, dest, jobs, retries, cli.output)
                .await?
        }

        Commands::Config { action } => commands::config_action(&store, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "wheelhouse",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}
