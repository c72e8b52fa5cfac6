// ABOUTME: runs the script execution daemon behind a local unix socket.
// ABOUTME: records every execution in a json-lines store so status survives the request that started it.

mod config;
mod engine;
mod scripts;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::scripts::ScriptCatalog;
use crate::store::{ExecutionStore, JsonlStore, MemoryStore};

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value = "/tmp/scriptboxd.sock")]
    socket_path: String,

    #[arg(long, default_value = "./scriptboxd-executions.jsonl")]
    store_path: PathBuf,

    /// Keep records in memory only; nothing survives a restart.
    #[arg(long, conflicts_with = "store_path")]
    memory_store: bool,

    /// JSON engine config; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref()).await?;
    tracing::info!(
        store_path = %args.store_path.display(),
        memory_store = args.memory_store,
        supported = ?config.supported_script_types,
        max_concurrent = ?config.max_concurrent_executions,
        "engine configured"
    );

    let catalog = ScriptCatalog::new(&config.scripts_dir);
    let store: Arc<dyn ExecutionStore> = if args.memory_store {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonlStore::new(&args.store_path))
    };
    let engine = Engine::new(config, store);
    server::run(&args.socket_path, engine, catalog).await
}
