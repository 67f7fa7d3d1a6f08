//! flowline CLI - run flows over JSONL data

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use flowline::batch::{serve_worker, BatchResult, BatchStatus, InputMapping, ProcessPool};
use flowline::config::{EngineConfig, Isolation, SchedulerMode};
use flowline::error::{FixSuggestion, FlowError};
use flowline::runtime::{interrupt, FlowPlan, LineExecutor};
use flowline::tool::ToolRegistry;
use flowline::BatchEngine;

#[derive(Parser)]
#[command(name = "flowline")]
#[command(about = "flowline - DAG flow runner for LLM pipelines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Engine overrides shared by every executing command
#[derive(Args, Debug, Default)]
struct EngineArgs {
    /// Node scheduler (sync, async)
    #[arg(long)]
    scheduler: Option<SchedulerMode>,

    /// Nodes running at once inside a line (capped at 16)
    #[arg(long)]
    node_concurrency: Option<usize>,

    /// Per-line timeout in seconds (0 disables)
    #[arg(long)]
    line_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow over every row of a JSONL data file
    Run {
        /// Path to the flow YAML
        flow: PathBuf,

        /// JSONL file, one object per row
        #[arg(short, long)]
        data: PathBuf,

        /// Input mapping, e.g. --map 'question=${data.q}'
        #[arg(short, long = "map")]
        mapping: Vec<String>,

        /// Directory receiving output.jsonl
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only run the first N rows
        #[arg(long)]
        max_lines: Option<usize>,

        /// Abort the batch on the first failing line
        #[arg(long)]
        raise_on_line_failure: bool,

        /// Lines running at once
        #[arg(long)]
        line_concurrency: Option<usize>,

        /// Where lines execute (in_process, process)
        #[arg(long)]
        isolation: Option<Isolation>,

        /// Print the full batch result as JSON
        #[arg(long)]
        json: bool,

        /// Write the batch event log to this JSON file
        #[arg(long)]
        events: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Run a single line with inputs given on the command line
    Test {
        /// Path to the flow YAML
        flow: PathBuf,

        /// Flow input, e.g. --input question=hello (JSON values accepted)
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Show the effective engine configuration
    Config {
        /// Also write it as TOML to this path
        #[arg(long)]
        save: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Load and validate a flow without running it
    Check {
        /// Path to the flow YAML
        flow: PathBuf,
    },

    /// Serve lines over stdin/stdout (used by process isolation)
    #[command(hide = true)]
    Worker {
        flow: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    // stdout carries results (and the worker protocol), logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            flow,
            data,
            mapping,
            output,
            max_lines,
            raise_on_line_failure,
            line_concurrency,
            isolation,
            json,
            events,
            engine,
        } => {
            let run = RunArgs {
                data,
                mapping,
                output,
                max_lines,
                raise_on_line_failure,
                line_concurrency,
                isolation,
                json,
                events,
            };
            run_batch(&flow, run, engine).await
        }
        Commands::Test { flow, inputs, engine } => test_line(&flow, &inputs, engine).await,
        Commands::Config { save, engine } => show_config(save.as_deref(), &engine),
        Commands::Check { flow } => check_flow(&flow),
        Commands::Worker { flow, engine } => run_worker(&flow, engine).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.downcast_ref::<FlowError>().and_then(|e| e.fix_suggestion()) {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

struct RunArgs {
    data: PathBuf,
    mapping: Vec<String>,
    output: Option<PathBuf>,
    max_lines: Option<usize>,
    raise_on_line_failure: bool,
    line_concurrency: Option<usize>,
    isolation: Option<Isolation>,
    json: bool,
    events: Option<PathBuf>,
}

fn load_config(engine: &EngineArgs) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::load()?.with_env()?;
    if let Some(scheduler) = engine.scheduler {
        config.scheduler = scheduler;
    }
    if let Some(n) = engine.node_concurrency {
        config.node_concurrency = n;
    }
    if let Some(secs) = engine.line_timeout {
        config.line_timeout_secs = (secs > 0).then_some(secs);
    }
    Ok(config)
}

fn load_plan(flow: &Path) -> anyhow::Result<Arc<FlowPlan>> {
    let registry = ToolRegistry::with_builtins();
    Ok(Arc::new(FlowPlan::from_file(flow, &registry)?))
}

/// Rows of a JSONL file (blank lines skipped)
fn read_rows(path: &Path) -> anyhow::Result<Vec<Map<String, Value>>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| match serde_json::from_str::<Value>(l) {
            Ok(Value::Object(row)) => Ok(row),
            Ok(_) => anyhow::bail!("{}:{}: row is not a JSON object", path.display(), i + 1),
            Err(e) => Err(e).with_context(|| format!("{}:{}", path.display(), i + 1)),
        })
        .collect()
}

async fn run_batch(flow: &Path, args: RunArgs, engine_args: EngineArgs) -> anyhow::Result<()> {
    let mut config = load_config(&engine_args)?;
    if let Some(n) = args.line_concurrency {
        config.line_concurrency = n;
    }
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }

    let plan = load_plan(flow)?;
    let rows = read_rows(&args.data)?;
    let mapping = if args.mapping.is_empty() {
        None
    } else {
        Some(InputMapping::from_pairs(args.mapping.iter().map(String::as_str))?)
    };

    println!(
        "{} {} | {} rows | {} scheduler | {} lines × {} nodes",
        "→".cyan(),
        flow.display().to_string().cyan().bold(),
        rows.len(),
        config.scheduler,
        config.effective_line_concurrency(),
        config.effective_node_concurrency()
    );

    let mut engine = BatchEngine::new(Arc::clone(&plan), config.clone());
    let pool = match config.isolation {
        Isolation::Process => {
            let pool = Arc::new(ProcessPool::for_flow(flow, &config)?);
            engine = engine.with_runner(pool.clone());
            Some(pool)
        }
        Isolation::InProcess => None,
    };

    let events = engine.events().clone();
    let listener = interrupt::install(engine.cancel_token(), config.force_exit_timeout());
    let result = engine
        .run(
            rows,
            mapping.as_ref(),
            args.output.as_deref(),
            args.max_lines,
            args.raise_on_line_failure,
        )
        .await;
    listener.abort();
    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    if let Some(path) = &args.events {
        let log = serde_json::to_string_pretty(&events.to_json())?;
        fs::write(path, log).with_context(|| format!("writing events to {}", path.display()))?;
    }
    let result = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    if let Some(dir) = &args.output {
        println!("  {} {}", "Output:".cyan(), dir.join(flowline::util::constants::OUTPUT_FILE_NAME).display());
    }
    Ok(())
}

fn show_config(save: Option<&Path>, engine_args: &EngineArgs) -> anyhow::Result<()> {
    let config = load_config(engine_args)?;
    print!("{}", toml::to_string_pretty(&config)?);
    println!(
        "# up to {} worker threads ({} lines × {} nodes)",
        config.thread_budget(),
        config.effective_line_concurrency(),
        config.effective_node_concurrency()
    );
    if let Some(path) = save {
        config.save_to(path)?;
        println!("{} {}", "Saved:".green(), path.display());
    }
    Ok(())
}

fn print_summary(result: &BatchResult) {
    let (mark, status) = match result.status {
        BatchStatus::Completed => ("✓".green(), "completed".green().bold()),
        BatchStatus::PartiallyCompleted => ("!".yellow(), "partially completed".yellow().bold()),
        BatchStatus::Failed => ("✗".red(), "failed".red().bold()),
        BatchStatus::Canceled => ("✗".red(), "canceled".red().bold()),
    };
    println!(
        "{} Batch {}: {}/{} lines completed in {}ms",
        mark,
        status,
        result.completed_lines,
        result.total_lines,
        result.system_metrics.duration_ms
    );
    if result.system_metrics.total_tokens > 0 {
        println!(
            "  Tokens: {} (prompt {}, completion {})",
            result.system_metrics.total_tokens,
            result.system_metrics.prompt_tokens,
            result.system_metrics.completion_tokens
        );
    }
    if let Some(summary) = result.summary() {
        println!("  {} {}", "!".yellow(), summary);
    }
    if let Some(aggr) = &result.aggr_results {
        println!("  {} {}", "Aggregation:".cyan(), Value::Object(aggr.output.clone()));
    }
}

async fn test_line(flow: &Path, raw_inputs: &[String], engine_args: EngineArgs) -> anyhow::Result<()> {
    let config = load_config(&engine_args)?;
    let plan = load_plan(flow)?;

    let mut row = Map::new();
    for pair in raw_inputs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("input '{}' must look like name=value", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        row.insert(key.trim().to_string(), value);
    }
    let inputs = flowline::batch::apply_mapping(plan.flow(), &flowline::batch::default_mapping(plan.flow()), &row)?;

    let executor = LineExecutor::new(plan, &config);
    let token = CancellationToken::new();
    let listener = interrupt::install(token.clone(), config.force_exit_timeout());
    let result = executor.run_line("test", 0, inputs, &token).await;
    listener.abort();

    for (name, info) in &result.node_run_infos {
        println!("  {} {:<20} {:?} {}ms", "•".cyan(), name, info.status, info.duration_ms);
    }
    match result.error() {
        Some(error) => anyhow::bail!("{}", error.message),
        None => {
            println!("{}", "Output:".cyan().bold());
            println!("{}", serde_json::to_string_pretty(&result.output)?);
            Ok(())
        }
    }
}

fn check_flow(flow: &Path) -> anyhow::Result<()> {
    let plan = load_plan(flow)?;
    let flow_def = plan.flow();
    println!("{} Flow '{}' is valid", "✓".green(), flow.display());
    println!("  Inputs: {}", flow_def.inputs.len());
    println!("  Nodes: {}", flow_def.regular_nodes().count());
    println!("  Aggregation nodes: {}", flow_def.aggregation_nodes().count());
    println!("  Outputs: {}", flow_def.outputs.len());
    Ok(())
}

async fn run_worker(flow: &Path, engine_args: EngineArgs) -> anyhow::Result<()> {
    let config = load_config(&engine_args)?;
    let executor = LineExecutor::new(load_plan(flow)?, &config);
    serve_worker(executor, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
