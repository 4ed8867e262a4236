use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowrun_core::config::AppConfig;
use flowrun_core::error::FlowError;
use flowrun_core::graph::GraphDef;
use flowrun_core::state::{self, State};
use flowrun_engine::Engine;
use flowrun_gateway::GatewayServer;
use flowrun_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Graph workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowrun.toml", env = "FLOWRUN_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a graph file once and print the final run state
    Run {
        /// Graph definition (JSON: {"start": ..., "nodes": {...}})
        #[arg(short, long)]
        graph: PathBuf,
        /// Initial state as a JSON object
        #[arg(short, long)]
        state: Option<String>,
        /// Id to store the graph under (defaults to the file stem)
        #[arg(long)]
        graph_id: Option<String>,
        /// Override the configured step bound
        #[arg(long)]
        max_steps: Option<usize>,
    },
    /// List registered tools
    Tools,
    /// Check a graph file for dangling node references
    Validate {
        #[arg(short, long)]
        graph: PathBuf,
    },
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
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowrun", &mut std::io::stdout());
        return Ok(());
    }

    let (config, config_missing) = load_config(&cli.config)?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if config_missing {
        info!(path = %cli.config.display(), "No config file, using defaults");
    }

    match cli.command {
        None => {
            Cli::command().print_help()?;
        }
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Tools) => {
            let registry = ToolRegistry::with_builtins();
            for name in registry.list() {
                let description = registry
                    .get(name)
                    .map(|t| t.description().to_string())
                    .unwrap_or_default();
                println!("{name:<24} {description}");
            }
        }
        Some(Commands::Validate { graph }) => {
            let graph = read_graph(&graph)?;
            let problems = graph.validate();
            if problems.is_empty() {
                println!("ok: {} nodes, start '{}'", graph.nodes.len(), graph.start);
            } else {
                for problem in &problems {
                    println!("{problem}");
                }
                anyhow::bail!("graph has {} dangling reference(s)", problems.len());
            }
        }
        Some(Commands::Run {
            graph,
            state,
            graph_id,
            max_steps,
        }) => {
            let graph_id = graph_id.unwrap_or_else(|| {
                graph
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "graph".to_string())
            });
            let definition = read_graph(&graph)?;
            let init_state = parse_state(state.as_deref())?;

            let mut engine_config = config.engine.clone();
            if let Some(max_steps) = max_steps {
                engine_config.max_steps = max_steps;
            }

            let engine = Engine::in_memory(engine_config, ToolRegistry::with_builtins());
            engine.create_graph(graph_id.as_str(), definition).await?;
            let run = engine.run_graph(&graph_id, init_state).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Some(Commands::Serve { bind }) => {
            let mut gateway_config = config.gateway.clone();
            if let Some(bind) = bind {
                gateway_config.bind = bind;
            }
            let engine = Engine::in_memory(config.engine.clone(), ToolRegistry::with_builtins());
            let tools = engine.tool_names().await.len();
            info!(bind = %gateway_config.bind, tools, "Starting gateway");

            let server = GatewayServer::new(gateway_config, engine);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<(AppConfig, bool)> {
    match AppConfig::load(path) {
        Ok(config) => Ok((config, false)),
        Err(FlowError::ConfigNotFound(_)) if !path.exists() => Ok((AppConfig::default(), true)),
        Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
    }
}

fn read_graph(path: &Path) -> anyhow::Result<GraphDef> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing graph file {}", path.display()))
}

fn parse_state(raw: Option<&str>) -> anyhow::Result<State> {
    let Some(raw) = raw else {
        return Ok(State::new());
    };
    let value: serde_json::Value = serde_json::from_str(raw).context("parsing --state")?;
    state::from_value(value).context("--state must be a JSON object")
}
