use log::{error, info, warn};
use std::net::SocketAddr;

use roomcast::config::ServerConfig;
use roomcast::core::server::Server;
use roomcast::handlers::websocket::routes;

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    // Load config from the environment
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, base_path={}",
        config.host, config.port, config.base_path
    );

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let server = Server::new(config);

    // Register the default application namespace
    if let Err(e) = server.namespace("/chat").await {
        error!("Failed to register namespace: {}", e);
        std::process::exit(1);
    }

    // Heartbeat sweep and lease refresh
    server.start();

    info!("Starting roomcast server on {}", addr);
    warp::serve(routes(server)).run(addr).await;
}
