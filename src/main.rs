use std::sync::Arc;

use stream_relay::catalog::InMemoryCatalog;
use stream_relay::decoder::FfmpegSpawner;
use stream_relay::manager::SessionManager;
use stream_relay::server::{self, AppState};
use stream_relay::sink::ChannelBroadcastSink;
use stream_relay::types::StreamId;

#[tokio::main]
async fn main() {
    let config = stream_relay::config::init();
    let _log_guard = config.log.init_tracing();

    let catalog = Arc::new(InMemoryCatalog::new());
    for stream in &config.streams {
        catalog.insert(StreamId::from(stream.id.clone()), stream.url.clone());
    }

    let sink = Arc::new(ChannelBroadcastSink::new());
    let spawner = Arc::new(FfmpegSpawner);
    let manager = SessionManager::new(&config, catalog, sink.clone(), spawner);
    manager.spawn_health_monitor();

    let state = AppState::new(manager, sink);
    if let Err(e) = server::start_server(state, &config.listen_addr).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
