use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cosmos_forge::collab::JsonlLearningSink;
use cosmos_forge::config::ForgeConfig;
use cosmos_forge::logging;
use cosmos_forge::oracle::OpenRouterOracle;
use cosmos_forge::{ExecutionOrchestrator, TaskContext};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "cosmos-forge",
    about = "Apply an LLM-generated change to a repository, gated by its compiler",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task and print the execution result as JSON
    Run {
        /// Path to the repository (defaults to current directory)
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Task description file (JSON)
        #[arg(long)]
        task: PathBuf,

        /// Token budget for context, overriding the task and config
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Write a default .cosmos/forge.toml
    Init {
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Replace an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show recorded runs, newest last
    History {
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    match args.command {
        Command::Run { repo, task, budget } => {
            let repo = repo
                .canonicalize()
                .with_context(|| format!("Repository not found: {}", repo.display()))?;
            let mut task = TaskContext::load(&task)?;
            if budget.is_some() {
                task.budget = budget;
            }

            let config = ForgeConfig::load(&repo);
            let oracle = OpenRouterOracle::from_config(&config)?;
            let orchestrator = ExecutionOrchestrator::new(&repo, config, Arc::new(oracle))
                .with_progress(|stage| eprintln!("  {}", stage));

            let result = orchestrator.execute(task).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Init { repo, force } => {
            let path = ForgeConfig::path(&repo);
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to replace it)", path.display());
            }
            ForgeConfig::default().save(&repo)?;
            println!("Wrote {}", path.display());
        }
        Command::History { repo, limit } => {
            let sink = JsonlLearningSink::new(&repo);
            let records = sink.load()?;
            if records.is_empty() {
                println!("No runs recorded in {}", sink.path().display());
            }
            let skip = records.len().saturating_sub(limit);
            for record in &records[skip..] {
                let status = match &record.failure {
                    None => "ok".to_string(),
                    Some(failure) => failure.tag(),
                };
                println!(
                    "{}  {}  {}  heal={}",
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    record.task_id,
                    status,
                    record.result.self_heal_attempts
                );
                let missed = record.missed();
                if !missed.is_empty() {
                    let missed: Vec<String> = missed.iter().map(|p| p.display().to_string()).collect();
                    println!("    predicted but untouched: {}", missed.join(", "));
                }
            }
        }
    }
    Ok(())
}
