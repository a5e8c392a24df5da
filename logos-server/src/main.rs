use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use logos_collab::{MemoryDocumentStore, ServerConfig, SyncServer};
use logos_core::{DocumentState, Layer};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = env::var("LOGOS_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = env::var("LOGOS_STORAGE_PATH") {
        config.storage_path = Some(PathBuf::from(path));
    }
    config
}

fn seed_demo_document(documents: &MemoryDocumentStore) -> Uuid {
    let document_id = match env::var("LOGOS_DEMO_DOCUMENT") {
        Ok(raw) => match Uuid::parse_str(&raw) {
            Ok(id) => id,
            Err(e) => {
                warn!("Ignoring LOGOS_DEMO_DOCUMENT={raw}: {e}");
                Uuid::new_v4()
            }
        },
        Err(_) => Uuid::new_v4(),
    };

    documents.insert(
        document_id,
        DocumentState::new("Demo garment")
            .with_layer(Layer::new("front-panel", "Front panel"))
            .with_layer(Layer::new("sleeve-left", "Left sleeve"))
            .with_layer(Layer::new("sleeve-right", "Right sleeve")),
    );
    document_id
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = config_from_env();
    let documents = Arc::new(MemoryDocumentStore::new());
    let demo = seed_demo_document(&documents);
    info!("Seeded demo document {demo}");

    if let Some(path) = &config.storage_path {
        info!("Version history stored at {}", path.display());
    }

    let server = SyncServer::open(config, documents)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, flushing pending auto-saves");
            let report = server.shutdown().await;
            if report.timed_out || report.failed > 0 {
                warn!("Shutdown flush incomplete: {report:?}");
            } else {
                info!("Shutdown flush finished: {report:?}");
            }
        }
    }

    Ok(())
}
