//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::config::{
    DEFAULT_FRESH_TTL_SECS, DEFAULT_MAX_BODY_BYTES, DEFAULT_STALE_TTL_SECS,
    DEFAULT_STORE_CAPACITY, MAX_TTL_SECS,
};

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "dyncache";
const ENV_PREFIX: &str = "DYNCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ORIGIN_SCHEME: &str = "https";
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COLLECTION: &str = "/posts/";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Scheme and authority of the origin, with an empty path.
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    pub store_capacity: NonZeroUsize,
    pub max_body_bytes: NonZeroUsize,
    pub single_flight_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub collections: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("proxy.collections"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    proxy: RawProxySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(host) = overrides.origin_host.as_ref() {
            self.origin.host = Some(host.clone());
        }
        if let Some(scheme) = overrides.origin_scheme.as_ref() {
            self.origin.scheme = Some(scheme.clone());
        }
        if let Some(seconds) = overrides.origin_timeout_seconds {
            self.origin.timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_fresh_ttl_seconds {
            self.cache.fresh_ttl_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_stale_ttl_seconds {
            self.cache.stale_ttl_seconds = Some(seconds);
        }
        if let Some(capacity) = overrides.cache_store_capacity {
            self.cache.store_capacity = Some(capacity);
        }
        if let Some(limit) = overrides.cache_max_body_bytes {
            self.cache.max_body_bytes = Some(limit);
        }
        if let Some(enabled) = overrides.cache_single_flight_refresh {
            self.cache.single_flight_refresh = Some(enabled);
        }
        if !overrides.proxy_collections.is_empty() {
            self.proxy.collections = Some(overrides.proxy_collections.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            cache,
            proxy,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let origin = build_origin_settings(origin)?;
        let cache = build_cache_settings(cache)?;
        let proxy = build_proxy_settings(proxy)?;

        Ok(Self {
            server,
            logging,
            origin,
            cache,
            proxy,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_seconds(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let scheme = origin
        .scheme
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_ORIGIN_SCHEME.to_string());
    if scheme != "http" && scheme != "https" {
        return Err(LoadError::invalid(
            "origin.scheme",
            format!("expected `http` or `https`, got `{scheme}`"),
        ));
    }

    let host = origin
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("origin.host", "origin host is required"))?;
    if host.contains("://") || host.contains(['/', '?', '#', '@']) {
        return Err(LoadError::invalid(
            "origin.host",
            format!("`{host}` must be a bare host name, without scheme or path"),
        ));
    }

    let base_url = Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|err| LoadError::invalid("origin.host", format!("`{host}`: {err}")))?;

    let timeout = positive_seconds(
        origin
            .timeout_seconds
            .unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS),
        "origin.timeout_seconds",
    )?;

    Ok(OriginSettings { base_url, timeout })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let fresh_ttl = ttl_seconds(
        cache.fresh_ttl_seconds.unwrap_or(DEFAULT_FRESH_TTL_SECS),
        "cache.fresh_ttl_seconds",
    )?;
    let stale_ttl = ttl_seconds(
        cache.stale_ttl_seconds.unwrap_or(DEFAULT_STALE_TTL_SECS),
        "cache.stale_ttl_seconds",
    )?;
    if stale_ttl <= fresh_ttl {
        return Err(LoadError::invalid(
            "cache.stale_ttl_seconds",
            format!(
                "must be greater than cache.fresh_ttl_seconds ({})",
                fresh_ttl.as_secs()
            ),
        ));
    }

    let store_capacity = non_zero_usize(
        cache.store_capacity.unwrap_or(DEFAULT_STORE_CAPACITY),
        "cache.store_capacity",
    )?;
    let max_body_bytes = non_zero_usize(
        cache.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "cache.max_body_bytes",
    )?;

    Ok(CacheSettings {
        fresh_ttl,
        stale_ttl,
        store_capacity,
        max_body_bytes,
        single_flight_refresh: cache.single_flight_refresh.unwrap_or(false),
    })
}

fn build_proxy_settings(proxy: RawProxySettings) -> Result<ProxySettings, LoadError> {
    let collections: Vec<String> = proxy
        .collections
        .unwrap_or_else(|| vec![DEFAULT_COLLECTION.to_string()])
        .into_iter()
        .map(|path| path.trim().to_string())
        .collect();

    if collections.is_empty() {
        return Err(LoadError::invalid(
            "proxy.collections",
            "at least one collection is required",
        ));
    }

    for (index, path) in collections.iter().enumerate() {
        validate_collection(path)
            .map_err(|reason| LoadError::invalid("proxy.collections", reason))?;

        for other in &collections[..index] {
            if other.starts_with(path.as_str()) || path.starts_with(other.as_str()) {
                return Err(LoadError::invalid(
                    "proxy.collections",
                    format!("`{path}` overlaps `{other}`"),
                ));
            }
        }
    }

    Ok(ProxySettings { collections })
}

fn validate_collection(path: &str) -> Result<(), String> {
    if path.len() < 2 || !path.starts_with('/') || !path.ends_with('/') {
        return Err(format!(
            "`{path}` must start and end with `/` and name at least one segment"
        ));
    }
    if path.starts_with("/_") {
        return Err(format!("`{path}` is reserved"));
    }
    if path.contains(['{', '}', '*', '?', '#']) || path.contains("//") {
        return Err(format!("`{path}` contains characters not allowed in a route"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    host: Option<String>,
    scheme: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    fresh_ttl_seconds: Option<u64>,
    stale_ttl_seconds: Option<u64>,
    store_capacity: Option<usize>,
    max_body_bytes: Option<usize>,
    single_flight_refresh: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProxySettings {
    collections: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn ttl_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value > MAX_TTL_SECS {
        return Err(LoadError::invalid(
            key,
            format!("must be at most {MAX_TTL_SECS} seconds (365 days)"),
        ));
    }
    positive_seconds(value, key)
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
