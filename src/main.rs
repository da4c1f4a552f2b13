use clap::Parser;
use dns_racer::{
    config::Config,
    redirect,
    resolver::{overrides::Overrides, racing::RacingResolver},
    server::Server,
    stats::{Stats, REPORT_EVERY},
};
use itertools::Itertools;
use std::{error::Error, path::PathBuf};
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // install global collector configured based on RUST_LOG env var, defaulting to info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let upstreams = config.upstreams()?;
    if upstreams.is_empty() {
        warn!("No upstream servers configured, only local names will resolve");
    }
    info!(
        upstreams = %upstreams.iter().join(", "),
        timeout_ms = config.general.timeout_ms,
        "Racing upstreams"
    );

    let stats = Stats::spawn(
        upstreams.clone(),
        config.general.show_stats.then_some(REPORT_EVERY),
    );
    let overrides = config.overrides();
    info!(entries = overrides.len(), "Loaded local names");
    let resolver = Overrides::new(
        RacingResolver::new(upstreams, config.timeout(), stats),
        overrides,
    );

    for &port in &config.http_listen_ports {
        let listener = redirect::bind(port).await?;
        info!(addr = %listener.local_addr()?, "Serving redirects");
        redirect::spawn(listener, config.redirects.clone());
    }

    let socket = UdpSocket::bind(config.bind_addr()).await?;
    let server = Server::new(socket, resolver);
    info!(addr = %server.local_addr()?, "Server up");

    server.run().await?;

    Ok(())
}
