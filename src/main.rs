//! modbus-slave: a Modbus-TCP slave serving holding registers
//!
//! Features:
//! - Read Holding Registers (0x03), Write Single Register (0x06) and
//!   Write Multiple Registers (0x10)
//! - Modbus exception replies for unsupported functions and bad addresses
//! - One task per client, with the register bank shared between them
//! - Hex dumps of every query and response in debug mode
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod registers;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        ip = %config.ip,
        port = config.port,
        register_count = config.register_count,
        debug = if config.debug { "enabled" } else { "disabled" },
        "Modbus server settings"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async {
        let server = Server::bind(&config).map_err(|e| {
            error!(address = %config.listen_addr(), error = %e, "Error listening on TCP socket");
            e
        })?;
        server.run().await
    })?;

    info!("Server shut down gracefully");
    Ok(())
}
