use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the dyncache binary.
#[derive(Debug, Parser)]
#[command(
    name = "dyncache",
    version,
    about = "Stale-while-revalidate caching reverse proxy"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "DYNCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the origin host (`host` or `host:port`).
    #[arg(long = "origin-host", value_name = "HOST")]
    pub origin_host: Option<String>,

    /// Override the origin scheme (http|https).
    #[arg(long = "origin-scheme", value_name = "SCHEME")]
    pub origin_scheme: Option<String>,

    /// Override the origin request timeout.
    #[arg(long = "origin-timeout-seconds", value_name = "SECONDS")]
    pub origin_timeout_seconds: Option<u64>,

    /// Override the fresh entry lifetime.
    #[arg(long = "cache-fresh-ttl-seconds", value_name = "SECONDS")]
    pub cache_fresh_ttl_seconds: Option<u64>,

    /// Override the stale entry lifetime.
    #[arg(long = "cache-stale-ttl-seconds", value_name = "SECONDS")]
    pub cache_stale_ttl_seconds: Option<u64>,

    /// Override the in-memory store capacity.
    #[arg(long = "cache-store-capacity", value_name = "COUNT")]
    pub cache_store_capacity: Option<usize>,

    /// Override the largest body written to the store, in bytes.
    #[arg(long = "cache-max-body-bytes", value_name = "BYTES")]
    pub cache_max_body_bytes: Option<usize>,

    /// Skip refreshes for resources whose refresh is already running.
    #[arg(
        long = "cache-single-flight-refresh",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_single_flight_refresh: Option<bool>,

    /// Replace the cached collections (repeatable).
    #[arg(long = "proxy-collection", value_name = "PATH")]
    pub proxy_collections: Vec<String>,
}
