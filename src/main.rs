//! # A RESP-Compatible In-Memory Data Server

use clap::Parser;
use log::info;
use resp_engine::cli::Args;
use resp_engine::engine::Engine;
use resp_engine::errors::ApplicationError;
use resp_engine::keyspace::Keyspace;
use resp_engine::server::Server;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    env_logger::init();
    info!("Starting the server...");

    let args = Args::parse();

    let engine: Arc<dyn Engine> = Arc::new(Keyspace::new());
    let server = Server::new(&args, Arc::clone(&engine)).await?;
    Server::install_shutdown_handler();
    server.start().await?;

    engine.close();
    Ok(())
}
