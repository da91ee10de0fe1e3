//! Autonomous task-execution agent.
//!
//! `pilot run` hands one task to the planner and prints its answer; `pilot
//! serve` keeps a worker running and reads tasks (or kill words) from stdin.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pilot::agents::AgentProfile;
use pilot::core::types::{AgentKind, Task, TaskSource};
use pilot::events::EventSink;
use pilot::exit_codes;
use pilot::fix_registry::FixRegistry;
use pilot::intake::{self, Submission, TaskQueue};
use pilot::io::config::{DEFAULT_CONFIG_PATH, PilotConfig, load_config, write_config};
use pilot::logging;
use pilot::runtime::Runtime;
use pilot::tools::{ToolId, ToolRegistry, handlers};

#[derive(Parser)]
#[command(name = "pilot", version, about = "Autonomous task-execution agent")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the configuration.
    Check,
    /// Run one task to completion and print the answer.
    Run {
        /// Task text.
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
        /// Print every event as a JSON line on stderr.
        #[arg(long)]
        events: bool,
    },
    /// Read tasks from stdin, one per line. Kill words stop the running task.
    Serve,
    /// List the capabilities and agents available with this configuration.
    Tools,
    /// Summarize the fix registry.
    Fixes,
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Check => {
            load_config(&cli.config)?;
            println!("{}: ok", cli.config.display());
            Ok(exit_codes::OK)
        }
        Command::Run { task, events } => cmd_run(&cli.config, &task.join(" "), events),
        Command::Serve => cmd_serve(&cli.config),
        Command::Tools => cmd_tools(&cli.config),
        Command::Fixes => cmd_fixes(&cli.config),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &PilotConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(path: &Path, text: &str, print_events: bool) -> Result<i32> {
    let runtime = Runtime::load(path)?;
    if print_events {
        runtime.events.subscribe_fn(256, |event| {
            if let Ok(line) = serde_json::to_string(event) {
                eprintln!("{line}");
            }
        });
    }
    let mut planner = runtime.planner()?;
    let outcome = planner.think(Task::new(text, TaskSource::Cli));
    runtime.events.close();
    println!("{}", outcome.response);
    Ok(if outcome.complete {
        exit_codes::OK
    } else {
        exit_codes::INCOMPLETE
    })
}

fn cmd_serve(path: &Path) -> Result<i32> {
    let runtime = Runtime::load(path)?;
    let (queue, tasks) = TaskQueue::new(
        runtime.config.planner.queue_capacity,
        runtime.config.safety.clone(),
        runtime.stop.clone(),
        runtime.events.clone(),
    );
    let worker = intake::spawn_worker(
        runtime.planner()?,
        tasks,
        runtime.stop.clone(),
        |task, outcome| {
            let marker = if outcome.complete { "done" } else { "incomplete" };
            println!("[{marker}] {}\n{}\n", task.text, outcome.response);
        },
    )?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match queue.submit(&line, TaskSource::Cli) {
            Submission::Queued { .. } => {}
            Submission::StopRequested => println!("stopping the current task"),
            Submission::Rejected { reason } => println!("rejected: {reason}"),
        }
        io::stdout().flush().context("flush stdout")?;
    }

    drop(queue);
    if worker.join().is_err() {
        eprintln!("planner worker panicked");
        return Ok(exit_codes::INVALID);
    }
    Ok(exit_codes::OK)
}

fn cmd_tools(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    let events = Arc::new(EventSink::new(0));
    let registry = ToolRegistry::from_handlers(handlers::builtin(&config, events))?;
    println!("capabilities:");
    for spec in registry.specs() {
        println!("  {:<14} {}", spec.name, spec.description);
    }
    println!("agents:");
    for kind in AgentKind::ALL {
        let profile = AgentProfile::for_kind(kind);
        let missing: Vec<&str> = profile
            .tools
            .iter()
            .filter(|id| !registry.contains(**id))
            .map(|id| id.as_str())
            .collect();
        let usable = profile
            .tools
            .iter()
            .any(|id| *id != ToolId::Think && registry.contains(*id));
        let state = match (usable, missing.is_empty()) {
            (false, _) => "unavailable".to_string(),
            (true, true) => "ready".to_string(),
            (true, false) => format!("partial, missing {}", missing.join(", ")),
        };
        println!("  {:<22} {} [{state}]", kind.deploy_tool(), profile.summary);
    }
    Ok(exit_codes::OK)
}

fn cmd_fixes(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    let registry = FixRegistry::open(
        &config.fixes.path,
        config.fixes.max_entries,
        Arc::new(EventSink::new(0)),
    );
    print!("{}", registry.report());
    Ok(exit_codes::OK)
}
