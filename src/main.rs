use std::sync::Arc;

use clap::Parser;
use responses_gateway::api::{self, AppState};
use responses_gateway::config::{Config, CONFIG_PATH_ENV};
use responses_gateway::db::Database;
use responses_gateway::logging;
use responses_gateway::memory::{DefaultSummarizer, MemoryStore};
use responses_gateway::model_info::ModelInfoCache;
use responses_gateway::orchestrator::Orchestrator;
use responses_gateway::provider::{OpenAiCompatibleProvider, Provider};

/// responses-gateway: a local context/memory gateway in front of a single
/// OpenAI-compatible backend.
#[derive(Parser, Debug)]
#[command(name = "responses-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path (overrides RESPONSES_GATEWAY_CONFIG)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address, e.g. 127.0.0.1:8089 (overrides config file)
    #[arg(long)]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        unsafe { std::env::set_var(CONFIG_PATH_ENV, path) };
    }

    let mut config = Config::load()?;
    if let Some(bind_addr) = cli.bind_addr {
        config.server.bind_addr = bind_addr;
    }
    logging::init(&config.logging.level);

    tracing::info!(bind_addr = %config.server.bind_addr, upstream = %config.upstream.base_url, "starting responses-gateway");

    let db = Database::connect(&config.database.path).await?;
    let store = MemoryStore::new(db);

    let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatibleProvider::new(
        config.upstream.base_url.clone(),
        config.upstream.api_key.clone(),
    ));

    let summarizer = Arc::new(DefaultSummarizer::new(
        provider.clone(),
        config.upstream.default_model.clone(),
        config.memory.clone(),
    ));

    let model_info_cache = Arc::new(ModelInfoCache::new(
        config.context.ctx_model_info_ttl_sec,
        config.context.ctx_default_context_length,
    ));

    let orchestrator = Orchestrator::new(
        store,
        provider,
        summarizer,
        model_info_cache,
        config.context.clone(),
        config.memory.clone(),
    );

    let app = api::create_router(AppState { orchestrator });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!(addr = %config.server.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
