//! CallStream server.
//!
//! Wires the configured store, the event bus, the simulated analyzer, and
//! the call engine behind the HTTP/WebSocket surface.
//!
//! Environment:
//! - `STORE_CONNECTION`: `memory://` (default) or `sqlite://<path>`
//! - `CALLSTREAM_BIND`: listen address, default `127.0.0.1:8080`
//! - `RUST_LOG`: env-filter directives, default `info`

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use callstream_core::{
    router, AppState, CallEngine, EventBus, IngestFacade, SimulatedAnalyzer, StoreConnection,
    TranscriptAnalyzer,
};

fn bind_addr() -> SocketAddr {
    std::env::var("CALLSTREAM_BIND")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store_connection = StoreConnection::from_env()?;
    info!("🦀 CallStream server starting");
    info!("   store: {store_connection}");

    let store = store_connection.build()?;
    let bus = EventBus::shared();
    let analyzer: Arc<dyn TranscriptAnalyzer> = Arc::new(SimulatedAnalyzer::new());
    let engine = CallEngine::new(store, bus.clone(), analyzer);
    let facade = Arc::new(IngestFacade::new(engine.clone()));

    let app = router(AppState {
        facade,
        engine,
        bus,
    });

    let addr = bind_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("✅ listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
