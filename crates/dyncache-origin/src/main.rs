use std::{net::SocketAddr, process};

use clap::Parser;
use dyncache_origin::{PostStore, build_router};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Mock origin server for the dyncache proxy.
#[derive(Debug, Parser)]
#[command(name = "dyncache-origin", version, about)]
struct Args {
    /// Listener host.
    #[arg(long, env = "DYNCACHE_ORIGIN_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listener port.
    #[arg(long, env = "DYNCACHE_ORIGIN_PORT", default_value_t = 8788)]
    port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if let Err(err) = run(args).await {
        error!(error = %err, "origin server stopped");
        process::exit(1);
    }
}

async fn run(args: Args) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "mock origin listening");

    axum::serve(listener, build_router(PostStore::new())).await
}
