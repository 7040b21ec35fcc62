//! Hotpatch CLI - chat-driven remote patching
//!
//! Usage:
//!   hotpatch init                      Write an example hotpatch.toml
//!   hotpatch targets                   List configured targets
//!   hotpatch log [-n N]                Show recent deploy log entries
//!   hotpatch session --operator <ID>   Console chat session

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hotpatch_core::config::DEFAULT_CONFIG_FILE;
use hotpatch_core::HotpatchConfig;
use hotpatch_remote::{
    get_api_key, get_code_host_token, AnthropicTransform, GitHubBlobStore, HttpDeployTrigger,
    Model,
};
use hotpatch_workflow::{AuditLog, ChatReply, ChatSession, WorkflowController};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hotpatch")]
#[command(author, version, about = "Chat-driven remote file patching with confirm-before-push")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List configured targets
    Targets,

    /// Show recent deploy log entries
    Log {
        /// Number of entries
        #[arg(short = 'n', long, default_value = "5")]
        entries: usize,
    },

    /// Start a console chat session
    Session {
        /// Operator identity for this session
        #[arg(long)]
        operator: String,

        /// Model override (defaults to model.default from config)
        #[arg(short, long)]
        model: Option<CliModel>,
    },
}

/// CLI-friendly model enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliModel {
    Opus,
    Sonnet,
    Haiku,
}

impl From<CliModel> for Model {
    fn from(m: CliModel) -> Self {
        match m {
            CliModel::Opus => Model::Opus,
            CliModel::Sonnet => Model::Sonnet,
            CliModel::Haiku => Model::Haiku,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.config, force),
        Commands::Targets => cmd_targets(&cli.config),
        Commands::Log { entries } => cmd_log(&cli.config, entries).await,
        Commands::Session { operator, model } => cmd_session(&cli.config, operator, model).await,
    }
}

fn load_config(path: &Path) -> Result<HotpatchConfig> {
    let config = HotpatchConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    HotpatchConfig::write_default(path).context("Failed to write config")?;
    println!("Wrote example configuration to {}", path.display());
    println!("Next:");
    println!("  1. Set authorized_operator and edit [targets.demo]");
    println!("  2. Export GITHUB_PAT and ANTHROPIC_API_KEY");
    println!("  3. Run `hotpatch session --operator <id>`");
    Ok(())
}

fn cmd_targets(path: &Path) -> Result<()> {
    let config = load_config(path)?;

    println!("{:<12} {:<40} {:<10} DEPLOY", "KEY", "FILE", "BRANCH");
    for (key, target) in config.target_specs() {
        println!(
            "{:<12} {:<40} {:<10} {}",
            key,
            target.to_string(),
            target.branch,
            target.deploy_url
        );
    }
    Ok(())
}

async fn cmd_log(path: &Path, entries: usize) -> Result<()> {
    let config = load_config(path)?;
    let audit = AuditLog::new(config.audit_log_path());

    let records = audit
        .recent(entries)
        .await
        .with_context(|| format!("Failed to read {}", audit.path().display()))?;

    if records.is_empty() {
        println!("No logs.");
    }
    for record in records {
        println!("{}", record);
    }
    Ok(())
}

async fn cmd_session(path: &Path, operator: String, model: Option<CliModel>) -> Result<()> {
    let config = load_config(path)?;

    let model = match model {
        Some(m) => m.into(),
        None => config
            .model
            .default
            .parse::<Model>()
            .map_err(anyhow::Error::msg)?,
    };

    let token = get_code_host_token(&config.github.token_env)?;
    let api_key = get_api_key(&config.model.api_key_env)?;

    let blob_store = GitHubBlobStore::new(&config.github.api_base, token)
        .with_commit_message(&config.github.commit_message)
        .with_timeout(Duration::from_secs(config.limits.store_timeout_secs));
    let transform =
        AnthropicTransform::new(api_key, model).with_max_tokens(config.model.max_tokens);
    let deploy = HttpDeployTrigger::new(Duration::from_secs(config.limits.deploy_timeout_secs));

    let controller = WorkflowController::from_config(
        &config,
        Arc::new(blob_store),
        Arc::new(transform),
        Arc::new(deploy),
    );
    let session = ChatSession::new(Arc::new(controller), operator);

    info!(
        "Session for operator {} using {} ({} targets)",
        session.operator(),
        model,
        config.targets.len()
    );
    println!("Type `<target>: <instruction>` to propose a change, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match session.handle_line(&line).await {
            ChatReply::Message(text) => println!("{}", text),
            ChatReply::Quit => break,
        }
    }

    Ok(())
}
