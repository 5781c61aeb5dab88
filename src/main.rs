use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blockbot::connector::ConsoleConnector;
use blockbot::engine::{ConversationEngine, EngineConfig};
use blockbot::flow::FlowDefinition;
use blockbot::logger::init_tracing;
use blockbot::modules::ModuleManager;
use blockbot::schema::write_schema;
use blockbot::storage::{MemoryStorage, Storage};
use clap::{Args, Parser, Subcommand};
use connector_plugin::connector::InboundSink;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "blockbot",
    about = "Scriptable block-based conversation engine",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine against a flow file with the console connector
    Run(RunArgs),

    /// Emit the JSON Schema for flow files
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Flow definition to load
    #[arg(long)]
    flow: PathBuf,

    /// Plugin root; relative module paths resolve against it
    #[arg(long)]
    plugins: Option<PathBuf>,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for the rolling JSON log file; stdout only if unset
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Deadline for one turn, in seconds
    #[arg(long, default_value = "30")]
    turn_timeout_secs: u64,

    /// Upper bound on chained go_to jumps within one turn
    #[arg(long, default_value = "16")]
    max_hops: usize,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory for the schema files
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

/// Resolve the blockbot root directory from the environment or use default.
fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("BLOCKBOT_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./blockbot")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => write_schema(args.out),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(&args.log_level, args.log_dir.clone())?;
    let root = resolve_root_dir();

    let storage: Arc<dyn Storage> = MemoryStorage::new();
    let flow = FlowDefinition::load(&args.flow)?;
    flow.seed(storage.as_ref())?;
    info!(title = %flow.title, blocks = flow.blocks.len(), modules = flow.modules.len(), "flow loaded");

    let plugin_root = args.plugins.unwrap_or_else(|| root.join("plugins"));
    let modules = ModuleManager::new(storage.clone(), plugin_root);

    let connector = ConsoleConnector::new();
    let config = EngineConfig {
        max_hops: args.max_hops,
        turn_timeout: Duration::from_secs(args.turn_timeout_secs),
        ..EngineConfig::default()
    };
    let engine = ConversationEngine::new(storage, connector.clone(), modules, config);

    tokio::select! {
        result = connector.listen(engine as Arc<dyn InboundSink>) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
