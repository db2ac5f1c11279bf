use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wayline_core::config::AppConfig;
use wayline_core::definition::WorkflowDefinition;
use wayline_core::types::ExecutionStatus;
use wayline_engine::ExecutionEngine;
use wayline_gateway::GatewayServer;
use wayline_store::Stores;
use wayline_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "wayline", version, about = "Durable multi-agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wayline.toml", env = "WAYLINE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control API
    Serve,
    /// Run one workflow definition to suspension or completion
    Run {
        /// Definition file (JSON)
        file: PathBuf,
        /// Initial state as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Compile a definition and report errors without running it
    Validate {
        /// Definition file (JSON)
        file: PathBuf,
    },
    /// Resume every execution left Pending or Running by a previous process
    Recover,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wayline=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "wayline", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Validate { file } => validate(&config, &file),
        Commands::Run { file, input } => run_file(&config, &file, &input).await,
        Commands::Recover => {
            let engine = build_engine(&config)?;
            load_workflows(&engine, &config);
            let recovered = engine.recover().await?;
            for exec in &recovered {
                println!("{}  {}  {}", exec.execution_id, exec.definition_id, exec.status);
            }
            println!("Recovered {} execution(s)", recovered.len());
            Ok(())
        }
        Commands::Serve => serve(&config).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn build_tools(config: &AppConfig) -> anyhow::Result<ToolRegistry> {
    let mut tools =
        ToolRegistry::with_builtins().with_default_timeout(config.engine.tool_timeout_secs);
    tools.register_classifiers(&config.classifiers)?;
    Ok(tools)
}

fn build_engine(config: &AppConfig) -> anyhow::Result<Arc<ExecutionEngine>> {
    let tools = build_tools(config)?;
    if let Some(parent) = config.store_path().parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let stores = Stores::open(config)?;
    let engine = ExecutionEngine::new(Arc::new(tools), stores.checkpoints, stores.executions)
        .with_config(config.engine.clone(), config.retry.clone());
    Ok(Arc::new(engine))
}

/// Register the definitions found in `[workflows] dir`, if it exists.
fn load_workflows(engine: &ExecutionEngine, config: &AppConfig) {
    let dir = config.workflows_dir();
    if !dir.is_dir() {
        info!(dir = %dir.display(), "No workflows directory");
        return;
    }
    match engine.load_definitions(&dir) {
        Ok(graphs) => info!(dir = %dir.display(), count = graphs.len(), "Workflows loaded"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to load workflows"),
    }
}

fn validate(config: &AppConfig, file: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)?;
    let tools = build_tools(config)?;
    let graph = wayline_engine::compile(&definition, &tools)
        .with_context(|| format!("{} is not a valid workflow", file.display()))?;
    println!(
        "{}@{}: {} nodes, start at '{}'",
        graph.id,
        graph.version,
        graph.node_count(),
        graph.start
    );
    Ok(())
}

async fn run_file(config: &AppConfig, file: &Path, input: &str) -> anyhow::Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(input).context("--input must be valid JSON")?;
    let definition = WorkflowDefinition::load(file)?;
    let engine = build_engine(config)?;
    let graph = engine.register(&definition)?;

    let exec = engine.start(&graph.id, &graph.version, input).await?;
    println!("{}", serde_json::to_string_pretty(&exec)?);

    if exec.status == ExecutionStatus::Suspended {
        for request in engine.pending_approvals(&exec.execution_id).await? {
            eprintln!(
                "Waiting for approval {} on node '{}' ({})",
                request.request_id, request.node_id, request.tier
            );
        }
    }
    if exec.status == ExecutionStatus::Failed {
        anyhow::bail!("execution {} failed", exec.execution_id);
    }
    Ok(())
}

async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    load_workflows(&engine, config);

    if config.engine.recover_on_start {
        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.recover().await {
                Ok(recovered) => info!(count = recovered.len(), "Recovery finished"),
                Err(e) => warn!(error = %e, "Recovery failed"),
            }
        });
    }

    let cancel = CancellationToken::new();
    let server = GatewayServer::new(config.gateway.clone().unwrap_or_default(), engine);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        shutdown.cancel();
    });

    server.run(cancel).await
}
