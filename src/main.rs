use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod embeddings;
mod mcp_server;
mod paper_store;
mod search_engine;
mod vector_store;

use embeddings::EmbeddingService;
use paper_store::PaperStore;
use search_engine::{EngineSettings, SearchEngine};
use vector_store::VectorStore;

fn get_data_dir() -> String {
    std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string())
}

fn get_corpus_path() -> String {
    std::env::var("PAPERS_CSV_PATH").unwrap_or_else(|_| "./data/papers.csv".to_string())
}

fn get_ollama_url() -> String {
    std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}

fn get_base_model() -> String {
    std::env::var("BASE_EMBEDDING_MODEL").unwrap_or_else(|_| "all-minilm".to_string())
}

fn get_custom_model() -> String {
    std::env::var("CUSTOM_EMBEDDING_MODEL").unwrap_or_else(|_| "all-minilm-finetuned".to_string())
}

fn get_base_collection() -> String {
    std::env::var("BASE_COLLECTION").unwrap_or_else(|_| "research_papers".to_string())
}

fn get_custom_collection() -> String {
    std::env::var("CUSTOM_COLLECTION").unwrap_or_else(|_| "research_papers_custom".to_string())
}

fn get_default_top_k() -> usize {
    std::env::var("TOP_K")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10)
}

fn get_encode_timeout_secs() -> u64 {
    std::env::var("ENCODE_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30)
}

fn get_search_timeout_secs() -> u64 {
    std::env::var("SEARCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10)
}

fn get_log_dir() -> String {
    std::env::var("LOG_DIR").unwrap_or_else(|_| {
        if std::path::Path::new("/var/log").exists() && is_writable("/var/log") {
            "/var/log/scholar-stream".to_string()
        } else {
            "./logs".to_string()
        }
    })
}

fn get_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn get_log_max_mb() -> u64 {
    std::env::var("LOG_MAX_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
}

fn is_writable(path: &str) -> bool {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(format!("{}/test_write", path))
        .map(|_| {
            let _ = std::fs::remove_file(format!("{}/test_write", path));
            true
        })
        .unwrap_or(false)
}

fn setup_logging() -> Result<()> {
    let log_dir = get_log_dir();
    let log_level = get_log_level();
    let log_max_mb = get_log_max_mb();

    std::fs::create_dir_all(&log_dir)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let is_development = std::env::var("DEVELOPMENT").is_ok() || std::env::var("DEV").is_ok();
    let force_console = std::env::var("CONSOLE_LOGS").is_ok();

    if is_development || force_console {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .init();
        tracing::info!("Development mode: logging to console");
    } else {
        let log_file = format!("{}/scholar-stream.log", log_dir);
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .json()
            .init();
    }

    tracing::info!("Logging initialized");
    tracing::info!("Log directory: {}", log_dir);
    tracing::info!("Log level: {}", log_level);
    tracing::info!("Log max size: {}MB (auto-truncate)", log_max_mb);

    Ok(())
}

async fn start_log_cleanup_task(log_dir: String, max_mb: u64) {
    let max_bytes = max_mb * 1024 * 1024;
    let log_file = format!("{}/scholar-stream.log", log_dir);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));

        loop {
            interval.tick().await;

            if let Ok(metadata) = std::fs::metadata(&log_file) {
                if metadata.len() > max_bytes {
                    if let Err(e) = std::fs::write(
                        &log_file,
                        format!("[LOG TRUNCATED - Size exceeded {}MB]\n", max_mb),
                    ) {
                        eprintln!("Failed to truncate log file: {}", e);
                    }
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    setup_logging()?;

    let data_dir = get_data_dir();
    let corpus_path = get_corpus_path();
    let log_dir = get_log_dir();
    let log_max_mb = get_log_max_mb();
    let ollama_url = get_ollama_url();
    let base_model = get_base_model();
    let custom_model = get_custom_model();
    let base_collection = get_base_collection();
    let custom_collection = get_custom_collection();
    let default_top_k = get_default_top_k();

    tokio::fs::create_dir_all(&data_dir).await?;

    start_log_cleanup_task(log_dir, log_max_mb).await;

    tracing::info!("Data directory: {}", data_dir);
    tracing::info!("Corpus CSV: {}", corpus_path);
    tracing::info!("Base model: {} -> collection '{}'", base_model, base_collection);
    tracing::info!(
        "Fine-tuned model: {} -> collection '{}'",
        custom_model,
        custom_collection
    );

    let paper_store = Arc::new(PaperStore::load(&corpus_path).await?);

    let store = Arc::new(
        VectorStore::open(&data_dir, &[custom_collection.as_str(), base_collection.as_str()])
            .await?,
    );

    let custom_encoder = Arc::new(EmbeddingService::new(&ollama_url, &custom_model).await?);
    let base_encoder = Arc::new(EmbeddingService::new(&ollama_url, &base_model).await?);

    let settings = EngineSettings {
        custom_collection,
        base_collection,
        encode_timeout: Duration::from_secs(get_encode_timeout_secs()),
        search_timeout: Duration::from_secs(get_search_timeout_secs()),
    };

    let engine = Arc::new(SearchEngine::new(
        paper_store,
        store.clone(),
        custom_encoder,
        base_encoder,
        settings,
    ));

    mcp_server::start_server(engine, store, default_top_k).await?;

    Ok(())
}
