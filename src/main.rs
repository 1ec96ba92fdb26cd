use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use conductor::checkpoint::FileCheckpointStore;
use conductor::coordinator::{Engine, ReviewAction, ReviewDecision, TaskRequest};
use conductor::core::task::{Priority, TaskId, TaskStatus};
use conductor::delegate::DelegateRegistry;
use conductor::{clog, Config, Error, Result};

/// Conductor - stage pipeline coordinator for delegated agent teams
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit a task and drive it until it finishes or needs an operator
    Run {
        /// What the task should produce
        description: String,

        /// low, normal, high or critical
        #[arg(long, short = 'p', default_value = "normal")]
        priority: String,

        /// JSON object passed to every delegate
        #[arg(long, short = 'c')]
        context: Option<String>,
    },

    /// Show the latest checkpointed status of a task
    Status {
        /// Task ID (full UUID or unique prefix)
        task_id: String,
    },

    /// Continue a task from its latest checkpoint
    Resume {
        /// Task ID (full UUID or unique prefix); omit with --all
        task_id: Option<String>,

        /// Resume every unfinished task in the checkpoint directory
        #[arg(long)]
        all: bool,
    },

    /// Show the review package for a parked task, or answer it
    Review {
        /// Task ID (full UUID or unique prefix)
        task_id: String,

        /// resume, abort, modify or fail; omit to print the package
        action: Option<String>,

        /// JSON payload for modify (context, results) or abort/fail (reason)
        #[arg(long)]
        payload: Option<String>,
    },

    /// Cancel a running or parked task
    Cancel {
        /// Task ID (full UUID or unique prefix)
        task_id: String,
    },

    /// List a task's checkpoints, oldest first
    History {
        /// Task ID (full UUID or unique prefix)
        task_id: String,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);
    if cli.debug {
        clog!("Conductor starting (debug mode enabled)");
    } else {
        clog!("Conductor starting");
    }

    let config = Config::load()?;
    if cli.command == Command::Config {
        return run_config(&config, cli.json);
    }
    config.ensure_dirs()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = build_engine(config)?;
        match cli.command {
            Command::Run {
                description,
                priority,
                context,
            } => run_task(&engine, description, &priority, context, cli.json).await,
            Command::Status { task_id } => run_status(&engine, &task_id, cli.json).await,
            Command::Resume { task_id, all } => run_resume(&engine, task_id, all, cli.json).await,
            Command::Review {
                task_id,
                action,
                payload,
            } => run_review(&engine, &task_id, action, payload, cli.json).await,
            Command::Cancel { task_id } => run_cancel(&engine, &task_id, cli.json).await,
            Command::History { task_id } => run_history(&engine, &task_id, cli.json).await,
            Command::Config => Ok(()),
        }
    })
}

fn build_engine(config: Config) -> Result<Engine> {
    let registry = DelegateRegistry::from_configs(&config.delegates)?;
    let store = FileCheckpointStore::new(config.checkpoints_dir()?);
    clog!(
        "Engine: {} delegate(s), checkpoints at {}",
        registry.len(),
        store.root().display()
    );
    Engine::builder(config)
        .registry(registry)
        .store(Arc::new(store))
        .build()
}

fn parse_json(flag: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| Error::Validation(format!("--{} is not valid JSON: {}", flag, e)))
}

/// Resolve a full UUID or a unique prefix against the checkpoint store.
async fn parse_task_id(engine: &Engine, id: &str) -> Result<TaskId> {
    if let Ok(task_id) = id.parse::<TaskId>() {
        return Ok(task_id);
    }

    let matches: Vec<TaskId> = engine
        .store()
        .task_ids()
        .await?
        .into_iter()
        .filter(|t| t.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => Err(Error::TaskNotFound(id.to_string())),
        1 => Ok(matches[0]),
        n => Err(Error::Validation(format!(
            "Ambiguous task ID '{}' matches {} tasks",
            id, n
        ))),
    }
}

async fn run_task(
    engine: &Engine,
    description: String,
    priority: &str,
    context: Option<String>,
    json: bool,
) -> Result<()> {
    let priority: Priority = priority.parse()?;
    let mut request = TaskRequest::new(&description).with_priority(priority);
    if let Some(context) = context {
        request = request.with_context(parse_json("context", &context)?);
    }

    let task_id = engine.submit(request).await?;
    if !json {
        println!("Task {} accepted", task_id);
    }
    let status = engine.wait(task_id).await?;
    report_outcome(engine, task_id, status, json).await
}

async fn run_status(engine: &Engine, id: &str, json: bool) -> Result<()> {
    let task_id = parse_task_id(engine, id).await?;
    let report = engine.status(task_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

async fn run_resume(engine: &Engine, id: Option<String>, all: bool, json: bool) -> Result<()> {
    let task_ids = match (id, all) {
        (Some(id), false) => {
            let task_id = parse_task_id(engine, &id).await?;
            engine.resume(task_id).await?;
            vec![task_id]
        }
        (None, true) => engine.resume_all().await?,
        _ => {
            return Err(Error::Validation(
                "pass either a task ID or --all".to_string(),
            ))
        }
    };

    if task_ids.is_empty() && !json {
        println!("No unfinished tasks");
    }
    for task_id in task_ids {
        let status = engine.wait(task_id).await?;
        report_outcome(engine, task_id, status, json).await?;
    }
    Ok(())
}

async fn run_review(
    engine: &Engine,
    id: &str,
    action: Option<String>,
    payload: Option<String>,
    json: bool,
) -> Result<()> {
    let task_id = parse_task_id(engine, id).await?;

    let Some(action) = action else {
        let package = engine.review_package(task_id).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&package)?);
            return Ok(());
        }
        println!("Task:     {}", package.task_id);
        println!("Status:   {}", package.status);
        println!("Summary:  {}", package.task_summary);
        if let Some(reason) = &package.blocking_reason {
            println!("Blocked:  {}", reason);
        }
        for verdict in &package.verdict_history {
            println!("Verdict:  {}", verdict);
        }
        for note in &package.notes {
            println!("Note:     {}", note);
        }
        if !package.recommendations.is_empty() {
            println!();
            println!("Recommendations:");
            for (i, rec) in package.recommendations.iter().enumerate() {
                println!("  {}. {}", i + 1, rec);
            }
        }
        return Ok(());
    };

    let action: ReviewAction = action.parse()?;
    let mut decision = ReviewDecision::new(action);
    if let Some(payload) = payload {
        decision = decision.with_payload(parse_json("payload", &payload)?);
    }

    engine.resume(task_id).await?;
    engine.submit_review(task_id, decision).await?;
    let status = engine.wait(task_id).await?;
    report_outcome(engine, task_id, status, json).await
}

async fn run_cancel(engine: &Engine, id: &str, json: bool) -> Result<()> {
    let task_id = parse_task_id(engine, id).await?;
    engine.resume(task_id).await?;
    engine.cancel(task_id).await?;
    let status = engine.wait(task_id).await?;
    report_outcome(engine, task_id, status, json).await
}

async fn run_history(engine: &Engine, id: &str, json: bool) -> Result<()> {
    let task_id = parse_task_id(engine, id).await?;
    let history = engine.history(task_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    for checkpoint in history {
        println!(
            "{:>4}  {}  {:<16} stage={}",
            checkpoint.sequence,
            checkpoint.written_at.format("%Y-%m-%d %H:%M:%S"),
            checkpoint.state.status().to_string(),
            checkpoint.state.task.current_stage_name()
        );
    }
    Ok(())
}

fn run_config(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!("# {}", Config::config_path()?.display());
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

async fn report_outcome(engine: &Engine, task_id: TaskId, status: TaskStatus, json: bool) -> Result<()> {
    let state = engine.state(task_id).await?;
    if json {
        let out = serde_json::json!({
            "task_id": task_id.to_string(),
            "status": status,
            "blocking_reason": state.task.blocking_reason,
            "output": state.task.output,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Task {}: {}", task_id.short(), format_status(status));
    match status {
        TaskStatus::Completed => {
            if let Some(output) = &state.task.output {
                println!("{}", serde_json::to_string_pretty(output)?);
            }
        }
        TaskStatus::HumanReview | TaskStatus::Escalated => {
            if let Some(reason) = &state.task.blocking_reason {
                println!("  Waiting on: {}", reason);
            }
            println!("  Inspect:    conductor review {}", task_id.short());
        }
        TaskStatus::Failed => {
            if let Some(reason) = &state.task.blocking_reason {
                println!("  Reason: {}", reason);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Format task status with color codes for terminal.
fn format_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        TaskStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        TaskStatus::HumanReview | TaskStatus::Escalated => format!("\x1b[33m{}\x1b[0m", status),
        _ => format!("\x1b[90m{}\x1b[0m", status),
    }
}
