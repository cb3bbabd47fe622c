//! Gateway server entrypoint: loads configuration, wires the real
//! adapters, and serves the WebSocket/HTTP gateway until terminated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use turn_controller::adapters::llm_http::HttpLlmAdapter;
use turn_controller::adapters::test_doubles::{TestSttAdapter, TestTtsAdapter};
use turn_controller::adapters::vector_sqlite::SqliteVectorStore;
use turn_controller::config::Config;
use turn_controller::gateway::{self, GatewayState};
use turn_controller::persistence::TurnRepository;
use turn_controller::rag::embedding::OnnxEmbedder;
use turn_controller::rag::RagRetriever;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("TURN_CONTROLLER_CONFIG").unwrap_or_else(|_| "turn-controller.toml".to_owned());
    let config = Config::from_file(Path::new(&config_path))
        .map_err(|e| anyhow::anyhow!("failed to load config from {config_path}: {e}"))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if let Some(dir) = &config.logging.log_dir {
        let appender = tracing_appender::rolling::daily(dir, "turn-controller.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // Leak the guard: it must outlive the subscriber for the life of the process.
        std::mem::forget(guard);
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("turn-controller-host starting");

    let llm: Arc<dyn turn_controller::adapters::LlmAdapter> =
        Arc::new(HttpLlmAdapter::new(config.llm.api_url.clone(), config.llm.model.clone(), config.llm.api_key.clone())
            .with_temperature(config.llm.temperature)
            .with_max_tokens(config.llm.max_tokens));

    // No network TTS client ships with this crate (interfaces only, per
    // scope); a deployment supplies its own `TtsAdapter` here.
    let tts: Arc<dyn turn_controller::adapters::TtsAdapter> = Arc::new(TestTtsAdapter::new(Vec::new()));

    let vector_store: Arc<dyn turn_controller::adapters::VectorStore> =
        Arc::new(SqliteVectorStore::open(&PathBuf::from(&config.vector.db_path))?);
    let embedder: Arc<dyn turn_controller::adapters::Embedder> =
        Arc::new(OnnxEmbedder::download_and_load().map_err(|e| anyhow::anyhow!("embedder load failed: {e}"))?);
    let retriever = Arc::new(RagRetriever::new(
        Arc::clone(&vector_store),
        Arc::clone(&embedder),
        config.rag.top_k,
        config.rag.min_similarity,
    ));

    let repository = Some(Arc::new(TurnRepository::open(&PathBuf::from(&config.vector.db_path))?));

    let state = GatewayState {
        stt_factory: Arc::new(|| Arc::new(TestSttAdapter::new()) as Arc<dyn turn_controller::adapters::SttAdapter>),
        llm,
        tts,
        vector_store,
        embedder,
        retriever,
        repository,
        bearer_token: config.gateway.bearer_token.clone(),
        chunk_size: config.rag.chunk_size,
        chunk_overlap: config.rag.chunk_overlap,
    };

    gateway::run(config.gateway, state).await.map_err(|e| {
        tracing::error!(error = %e, "turn-controller-host exited with error");
        e
    })?;

    tracing::info!("turn-controller-host shut down cleanly");
    Ok(())
}
