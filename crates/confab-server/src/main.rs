//! Standalone directory server binary.

use std::net::SocketAddr;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confab_core::adapters::net::server::DirectoryServer;

#[derive(Parser, Debug)]
#[command(about = "Directory and call registry server")]
struct Args {
    /// Control endpoint to listen on.
    #[arg(long, default_value = "0.0.0.0:50500")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(addr = %args.listen, "directory server starting");
    DirectoryServer::bind(args.listen).await?.run().await
}
