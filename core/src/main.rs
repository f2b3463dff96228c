/// chatsync terminal client - main entry point
use chatsync_core::{ChatSession, Config, DocumentStore, LocalDocumentStore};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
        )
        .with_writer(std::io::stderr)
        .init();

    let store = match &config.data_dir {
        Some(dir) => LocalDocumentStore::open(dir),
        None => LocalDocumentStore::in_memory(),
    }
    .map_err(|e| anyhow::anyhow!("Document store error: {}", e))?
    .with_latency_compensation(config.latency_compensation);

    info!("Starting chatsync for {}", config.user.uid);

    let backend: Arc<dyn DocumentStore> = Arc::new(store.clone());
    let session = ChatSession::new(config, backend);

    chatsync_core::cli_app::run(session, store).await
}
