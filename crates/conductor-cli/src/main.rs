//! `conductor` command-line runner.

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor_orchestrator::{
    load_definition, validate_chain, validate_pipeline, ChainDefinition, ChainExecutor,
    OrchestratorConfig, PipelineDefinition, PipelineExecutor,
};
use conductor_tools::ToolRegistry;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: pipeline, chain and team orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a pipeline or chain definition without running it
    Validate {
        /// Definition file (.json or .toml)
        file: PathBuf,
        /// Treat the file as a chain definition
        #[arg(long)]
        chain: bool,
    },
    /// Run a pipeline definition
    Run {
        /// Pipeline file (.json or .toml)
        file: PathBuf,
        /// Pipeline input as a JSON document
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Run a chain definition
    Chain {
        /// Chain file (.json or .toml)
        file: PathBuf,
        /// Chain input as a JSON document
        #[arg(short, long)]
        input: Option<String>,
    },
    /// List the registered tools
    Tools,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    OrchestratorConfig::from_file(path)
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

fn parse_input(input: Option<&str>) -> anyhow::Result<Value> {
    match input {
        Some(text) => serde_json::from_str(text).context("--input is not valid JSON"),
        None => Ok(Value::Null),
    }
}

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    conductor_builtins::register_builtins(&mut registry);
    info!(count = registry.tool_count(), "Built-in tools registered");
    Arc::new(registry)
}

/// A token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            trigger.cancel();
        }
    });
    token
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file, chain } => {
            if chain {
                let def: ChainDefinition = load_definition(&file)?;
                validate_chain(&def)?;
                println!("Chain '{}' is valid ({} steps)", def.id, def.steps.len());
            } else {
                let def: PipelineDefinition = load_definition(&file)?;
                validate_pipeline(&def)?;
                println!("Pipeline '{}' is valid ({} steps)", def.id, def.steps.len());
            }
            Ok(true)
        }
        Commands::Run { file, input } => {
            let def: PipelineDefinition = load_definition(&file)?;
            let input = parse_input(input.as_deref())?;
            let executor = PipelineExecutor::new(registry()).with_config(&config);
            let result = executor
                .execute_with_cancellation(&def, input, interrupt_token())
                .await;
            print_json(&result)?;
            Ok(result.success)
        }
        Commands::Chain { file, input } => {
            let def: ChainDefinition = load_definition(&file)?;
            let input = parse_input(input.as_deref())?;
            let executor =
                ChainExecutor::new(registry()).with_max_concurrency(config.max_concurrency);
            let result = executor
                .execute_chain_with_cancellation(&def, input, interrupt_token())
                .await;
            print_json(&result)?;
            Ok(result.success)
        }
        Commands::Tools => {
            let registry = registry();
            let tools = registry.list_descriptors();
            println!("Registered tools:");
            for tool in &tools {
                println!("  {}: {}", tool.name, tool.description);
                let required = tool.required_params();
                if !required.is_empty() {
                    println!("    required: {}", required.join(", "));
                }
            }
            println!("\nTotal: {} tool(s)", tools.len());
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
