use clap::Parser;
use log::{error, info};
use socks4a::{Config, SOCKS4Server};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::parse();

    let server = match SOCKS4Server::from_config(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to listen on {}: {}", config.listen_addr(), e);
            std::process::exit(1);
        }
    };

    info!("Listening on {}", config.listen_addr());
    server.run().await;
}
