//! A server hosting a flat world, configured from the environment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::net::ToSocketAddrs;
use std::io;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use blockwire::generator::FlatGenerator;
use blockwire::world::{World, TICK_DURATION};

use blockwire_net::config::{self, ConnectionConfig};
use blockwire_net::server::Server;


/// Storing true while the server should run.
static RUNNING: AtomicBool = AtomicBool::new(true);


pub fn main() {

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    if let Err(e) = ctrlc::set_handler(|| RUNNING.store(false, Ordering::Relaxed)) {
        warn!("failed to install ctrl-c handler: {e}");
    }

    if let Err(e) = run() {
        error!("server failed: {e}");
        std::process::exit(1);
    }

}

fn run() -> io::Result<()> {

    let world = World::new()
        .with_generator(FlatGenerator::default())
        .with_directory(config::world_dir());
    world.set_block_updates_enabled(config::block_updates());

    let world = Arc::new(world);
    let _ticker = world.start_entity_ticker(TICK_DURATION)?;

    let addr = config::bind_addr().to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no bind address"))?;

    let mut server = Server::new(world, ConnectionConfig::default());
    server.bind(addr)?;
    info!("world directory: {}", config::world_dir().display());

    server.run(&RUNNING)?;

    info!("stopping server...");
    server.stop().map_err(io::Error::other)?;
    Ok(())

}
