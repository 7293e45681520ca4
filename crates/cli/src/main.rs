use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use meridian_api::{ApiServer, AppState, resolve_bind_address};
use meridian_engine::{
    ContextBuilder, ContextRequest, DirectoryPatternSource, EngineConfig, Orchestrator, PatternStore, Runtime,
    StaticSnapshotSource, load_config, runtime::PreviewHandler,
};
use meridian_types::{ExecuteResponse, Value};
use tracing::{info, warn};

/// Run and serve Meridian analytics patterns.
#[derive(Parser, Debug)]
#[command(name = "meridian", version, about)]
struct Cli {
    /// Engine configuration file (defaults to $MERIDIAN_CONFIG_PATH or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API until interrupted
    Serve {
        /// Override server.bind_address
        #[arg(long)]
        bind: Option<String>,

        /// Answer every capability with the echo handler
        #[arg(long)]
        preview: bool,
    },
    /// Run one pattern and print its outputs and trace as JSON
    Run {
        pattern: String,

        /// Input value as name=value; values parse as YAML scalars
        #[arg(long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,

        /// Accept a warming snapshot
        #[arg(long)]
        allow_stale: bool,

        /// Answer every capability with the echo handler
        #[arg(long)]
        preview: bool,
    },
    /// Inspect pattern definitions
    Patterns {
        #[command(subcommand)]
        command: PatternsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PatternsCommand {
    /// List pattern ids in the configured directory
    List,
    /// Validate every pattern, or only the named one
    Validate { pattern: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load engine configuration")?;

    match cli.command {
        Command::Serve { bind, preview } => serve(config, bind, preview).await,
        Command::Run {
            pattern,
            inputs,
            allow_stale,
            preview,
        } => run_pattern(config, &pattern, &inputs, allow_stale, preview).await,
        Command::Patterns { command } => patterns(config, command).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

struct Engine {
    orchestrator: Orchestrator,
    contexts: ContextBuilder,
}

async fn build_engine(config: &EngineConfig, preview: bool) -> Result<Engine> {
    let store = Arc::new(PatternStore::new(Arc::new(DirectoryPatternSource::new(
        config.patterns.directory.clone(),
    ))));

    let mut runtime = Runtime::new(config.breaker.to_breaker_config());
    if preview {
        let capabilities = referenced_capabilities(&store).await?;
        info!(capabilities = capabilities.len(), "registering preview handler");
        runtime
            .register(PreviewHandler::registration(capabilities))
            .context("failed to register preview handler")?;
    } else {
        warn!("no capability handlers are linked into this binary; steps will fail unless --preview is set");
    }

    let snapshots = Arc::new(StaticSnapshotSource::new(config.snapshot.to_state()));
    Ok(Engine {
        orchestrator: Orchestrator::new(store, Arc::new(runtime)),
        contexts: ContextBuilder::new(snapshots),
    })
}

/// Capabilities named by every valid pattern in the store.
async fn referenced_capabilities(store: &PatternStore) -> Result<Vec<String>> {
    let mut capabilities: Vec<String> = Vec::new();
    for outcome in store.reload_all().await? {
        let Ok(key) = outcome.result else {
            continue;
        };
        let definition = store.load_version(&key.id, &key.version).await?;
        for capability in definition.capabilities() {
            if !capabilities.iter().any(|known| known == capability) {
                capabilities.push(capability.to_string());
            }
        }
    }
    Ok(capabilities)
}

async fn serve(config: EngineConfig, bind: Option<String>, preview: bool) -> Result<()> {
    let bind_address = resolve_bind_address(bind.as_deref().unwrap_or(&config.server.bind_address))?;
    let engine = build_engine(&config, preview).await?;
    let state = AppState::new(engine.orchestrator, engine.contexts, config.server.run_timeout())
        .with_cancel_grace(config.server.cancel_grace());

    let server = ApiServer::new(bind_address, state).start().await?;
    println!("meridian listening on http://{}", server.bound_address());

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    server.stop().await
}

async fn run_pattern(config: EngineConfig, pattern: &str, raw_inputs: &[String], allow_stale: bool, preview: bool) -> Result<()> {
    let inputs = parse_inputs(raw_inputs)?;
    let engine = build_engine(&config, preview).await?;

    let mut request = ContextRequest::new();
    if allow_stale {
        request = request.allow_stale();
    }
    let context = engine.contexts.build(request).await?;

    match engine.orchestrator.run(pattern, context, inputs).await {
        Ok(output) => {
            let response = ExecuteResponse {
                outputs: output.outputs,
                trace: output.trace,
            };
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure.trace)?);
            Err(anyhow!("{} ({})", failure.error, failure.error.code()))
        }
    }
}

async fn patterns(config: EngineConfig, command: PatternsCommand) -> Result<()> {
    let store = PatternStore::new(Arc::new(DirectoryPatternSource::new(config.patterns.directory.clone())));
    match command {
        PatternsCommand::List => {
            for pattern_id in store.list().await? {
                println!("{pattern_id}");
            }
        }
        PatternsCommand::Validate { pattern: Some(pattern) } => {
            let definition = store.load(&pattern).await?;
            println!("ok   {}", definition.key());
        }
        PatternsCommand::Validate { pattern: None } => {
            let outcomes = store.reload_all().await?;
            let mut invalid = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(key) => println!("ok   {key}"),
                    Err(error) => {
                        invalid += 1;
                        println!("FAIL {}: {error}", outcome.pattern_id);
                    }
                }
            }
            if invalid > 0 {
                bail!("{invalid} of {} patterns failed validation", outcomes.len());
            }
        }
    }
    Ok(())
}

/// Parses `name=value` pairs. Values are read as YAML so `252` and `true` keep their types.
fn parse_inputs(raw: &[String]) -> Result<IndexMap<String, Value>> {
    let mut inputs = IndexMap::new();
    for pair in raw {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("input '{pair}' must look like name=value"))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("input '{pair}' has an empty name");
        }
        let value = serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::from(value));
        inputs.insert(name.to_string(), value);
    }
    Ok(inputs)
}
