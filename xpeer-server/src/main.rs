use xpeer_server::{Server, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!("starting xpeer server on {}", config.bind_addr());

    let server = Server::new(config);
    if let Err(err) = server.run().await {
        log::error!("server error: {err}");
        std::process::exit(1);
    }
}
