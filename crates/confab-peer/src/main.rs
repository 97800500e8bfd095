//! Headless peer binary: the full session engine with synthetic devices.
//!
//! Useful for soak-testing a directory server and for running scripted
//! calls between hosts without any UI.

mod bridge;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confab_core::adapters::net::peer::{PeerConfig, PeerEngine};

use bridge::{Autopilot, SilentSink, TestPatternSource};

#[derive(Parser, Debug)]
#[command(about = "Headless group-call peer")]
struct Args {
    /// Directory server control endpoint.
    #[arg(long, default_value = "127.0.0.1:50500")]
    server: SocketAddr,

    /// Name to register under.
    #[arg(long)]
    name: String,

    /// Dial this peer once registered.
    #[arg(long)]
    call: Option<String>,

    /// Accept incoming call prompts instead of rejecting them.
    #[arg(long)]
    auto_accept: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(name = %args.name, server = %args.server, "peer starting");

    let engine = PeerEngine::new(
        PeerConfig {
            server_addr: args.server,
            name: args.name,
        },
        Arc::new(TestPatternSource::start()),
        Arc::new(SilentSink::default()),
        Arc::new(Autopilot::new(args.call, args.auto_accept)),
    );
    engine.run().await
}
