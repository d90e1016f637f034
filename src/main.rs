//! Rendezvous signaling & relay server binary entry point.
//!
//! Configuration is environment-driven (`HOST`, `PORT`, `UPLOAD_DIR`); see
//! [`rendezvous_relay::config::Config`]. Everything else is compile-time.

use rendezvous_relay::config::Config;
use rendezvous_relay::RendezvousServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let server = RendezvousServer::new(config);

    if let Err(e) = server.run().await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
