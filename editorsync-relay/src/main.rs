use editorsync::server::{ServerConfig, SyncServer};
use log::{error, info};

/// Bind address: first argument, then `EDITORSYNC_BIND`, then the default.
fn bind_addr() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EDITORSYNC_BIND").ok())
        .unwrap_or_else(|| ServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig { bind_addr: bind_addr(), ..ServerConfig::default() };
    info!("Starting editorsync relay on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
