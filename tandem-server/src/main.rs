//! tandem-server — standalone CRDT sync server.
//!
//! Listens on `HOST:PORT` (default `0.0.0.0:1234`); clients join a room with
//! `ws://host:port/<room>`. Log output is controlled with `RUST_LOG`.

use log::{error, info};
use std::process::ExitCode;
use tandem_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting tandem-server on {} (max {} clients per room)",
        config.bind_addr(),
        config.max_clients_per_room
    );

    let server: SyncServer = SyncServer::new(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    match server.run_until(shutdown).await {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
