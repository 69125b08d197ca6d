//! Application orchestrator: wires storage, coordinator and server together.

use std::sync::Arc;

use chunkdock_server::{ServerConfig, UploadServer};
use chunkdock_transfer::{Coordinator, FileRecordStore};

use crate::config::Config;
use crate::handler::UploadHandler;

/// Runs the daemon until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // -- Storage --
    let storage = config.storage_config();
    std::fs::create_dir_all(&storage.base_path)?;
    let records = FileRecordStore::open(config.records_dir())?;
    tracing::info!(
        base = %storage.base_path.display(),
        records = %records.dir().display(),
        merge_policy = ?storage.merge_policy,
        max_upload_size = storage.max_upload_size,
        "storage ready"
    );

    let coordinator = Arc::new(Coordinator::new(storage, records));

    // -- WS server --
    let server_config = ServerConfig {
        port: config.port,
        max_connections: config.max_connections,
    };
    let server = UploadServer::new(server_config, UploadHandler::new(coordinator));
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    // -- Main loop: wait for shutdown --
    tokio::select! {
        result = &mut server_task => {
            // The server only returns early when it could not bind.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    // -- Graceful shutdown --
    server.shutdown();
    server_task.await??;

    Ok(())
}
