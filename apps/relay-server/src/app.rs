//! Wires the registry and the HTTP server together.

use std::sync::Arc;

use liverelay_http::RelayServer;
use liverelay_relay::TransportRegistry;

use crate::config::Config;

/// Runs the relay until Ctrl-C or a fatal server error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(TransportRegistry::new(config.conflict_policy));
    let server = RelayServer::new(config.server_config(), Arc::clone(&registry));

    tracing::info!(
        root = %config.root_dir.display(),
        policy = ?registry.policy(),
        queue = ?config.queue_policy(),
        "relay configured"
    );

    let server_run = Arc::clone(&server);
    let mut serving = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut serving => {
            // Bind failure or similar: nothing is running anymore.
            registry.shutdown().await;
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutdown signal received");
        }
    }

    server.shutdown();
    let active = registry.len().await;
    if active > 0 {
        tracing::warn!(active, "aborting in-flight uploads");
    }
    registry.shutdown().await;
    serving.await??;
    Ok(())
}
