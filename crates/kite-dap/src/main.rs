use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Debug adapter bridging the Debug Adapter Protocol to a Chrome-style
/// remote debugging runtime.
///
/// The adapter speaks DAP over stdio. Runtime connectivity is supplied by
/// the embedding product; this standalone binary rejects `attach` until a
/// transport is linked in.
#[derive(Debug, Parser)]
#[command(name = "kite-dap", version, about)]
struct Cli {
    /// Log filter, e.g. `kite=debug` (overrides RUST_LOG).
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log {
        Some(filter) => EnvFilter::try_new(filter)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // stdout carries the DAP stream; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    kite_dap::server::run_stdio(Arc::new(kite_dap::server::UnsupportedConnector)).await
}
