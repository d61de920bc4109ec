//! Standalone relay server.
//!
//! Usage: `orbit-relay [BIND_ADDR]`. The address falls back to
//! `ORBIT_RELAY_ADDR`, then to the default `127.0.0.1:9090`.

use orbit_sync::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ORBIT_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    let relay = RelayServer::new(config);
    if let Err(e) = relay.run().await {
        log::error!("relay stopped: {e}");
        std::process::exit(1);
    }
}
