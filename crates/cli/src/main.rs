//! Automerger command-line tool.
//!
//! Provides subcommands for validating the service configuration and the
//! automerger document, inspecting which edges apply to a project,
//! classifying commit messages, rendering topic queries and running a trial
//! merge against a local repository.

mod edges;
mod style;
mod trial_merge;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use automerger_core::config::ServiceConfig;
use automerger_core::review::gerrit::ConfigLocation;
use automerger_core::review::topic_query;
use automerger_core::{AutomergerConfig, CommitClassifier, GerritClient, ReviewApi};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Automerger command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "automerger",
    version,
    about = "Inspect and test automerger propagation rules"
)]
struct Cli {
    /// Path to the TOML service configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/automerger/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the service configuration and, optionally, an automerger document.
    Validate {
        /// Local automerger document to check as well.
        #[arg(short, long)]
        document: Option<PathBuf>,
    },

    /// Show the edges that apply to a project.
    Edges {
        /// Project name.
        #[arg(short, long)]
        project: String,

        /// Only edges leaving this branch.
        #[arg(short, long)]
        source: Option<String>,

        /// Read the automerger document from this file instead of the server.
        #[arg(short, long)]
        document: Option<PathBuf>,
    },

    /// Classify a commit message.
    Classify {
        /// The full commit message.
        message: String,

        /// Use the markers from this automerger document.
        #[arg(short, long)]
        document: Option<PathBuf>,
    },

    /// Print the query that finds every change with a topic.
    TopicQuery {
        topic: String,
    },

    /// Merge a commit onto a branch of a local repository without writing anything.
    TrialMerge {
        /// Path to the repository.
        #[arg(long)]
        repo: PathBuf,

        /// Source commit.
        #[arg(long)]
        source: String,

        /// Destination branch.
        #[arg(long)]
        dest: String,

        /// Merge content even for "do not merge" changes.
        #[arg(long)]
        merge_all: bool,

        /// Use the markers from this automerger document.
        #[arg(short, long)]
        document: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{e:#}")));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { document } => cmd_validate(&cli.config, document.as_deref()),
        Commands::Edges {
            project,
            source,
            document,
        } => {
            let doc = load_document(&cli.config, document.as_deref()).await?;
            edges::run(&doc, &project, source.as_deref());
            Ok(())
        }
        Commands::Classify { message, document } => {
            let classifier = match document {
                Some(path) => read_document(&path)?.classifier(),
                None => CommitClassifier::default(),
            };
            println!("{}", classifier.classify(&message));
            Ok(())
        }
        Commands::TopicQuery { topic } => {
            println!("{}", topic_query(&topic));
            Ok(())
        }
        Commands::TrialMerge {
            repo,
            source,
            dest,
            merge_all,
            document,
        } => {
            let classifier = match document {
                Some(path) => read_document(&path)?.classifier(),
                None => CommitClassifier::default(),
            };
            trial_merge::run(&repo, &source, &dest, merge_all, &classifier)
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<ServiceConfig> {
    let mut config =
        ServiceConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    Ok(config)
}

fn read_document(path: &Path) -> Result<AutomergerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    AutomergerConfig::parse(&text).context("failed to parse automerger document")
}

/// The automerger document from `file`, or from the review server when no
/// file is given.
async fn load_document(config_path: &Path, file: Option<&Path>) -> Result<AutomergerConfig> {
    if let Some(path) = file {
        return read_document(path);
    }

    let config = load_config(config_path)?;
    let password = config
        .review
        .password
        .clone()
        .context("review password was not resolved")?;
    let client = GerritClient::new(
        &config.review.url,
        &config.review.username,
        &password,
        ConfigLocation {
            project: config.review.config_project.clone(),
            refname: config.review.config_ref.clone(),
            file: config.review.config_file.clone(),
        },
    )
    .context("failed to create review client")?;

    let text = client
        .config_document()
        .await
        .context("failed to fetch automerger document")?
        .context("the review server has no automerger document")?;
    AutomergerConfig::parse(&text).context("failed to parse automerger document")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_validate(config_path: &Path, document: Option<&Path>) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        ServiceConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.resolve_env_vars() {
        Ok(()) => println!("  [OK] Environment variable references resolved"),
        Err(e) => println!("  [WARN] {e}"),
    }

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {e}");
            anyhow::bail!("configuration validation failed");
        }
    }

    if let Some(path) = document {
        let doc = read_document(path)?;
        println!("  [OK] Automerger document parsed: {} edges", doc.edges().len());
        for skipped in doc.skipped() {
            println!("  [WARN] Skipped entry: {skipped}");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Review URL    : {}", config.review.url);
    println!("  Account       : {}", config.review.username);
    println!(
        "  Password      : {}",
        if config.review.password.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!(
        "  Event secret  : {}",
        if config.daemon.event_secret.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!(
        "  Document      : {}:{}/{}",
        config.review.config_project, config.review.config_ref, config.review.config_file
    );
    println!("  Listen        : {}", config.daemon.listen);
    println!("  Mirror dir    : {}", config.daemon.mirror_dir.display());
    println!(
        "  Mirror labels : {}",
        config.propagation.mirror_labels.join(", ")
    );
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(())
}
