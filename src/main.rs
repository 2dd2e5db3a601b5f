use std::{process, sync::Arc, time::Duration};

use dyncache::{
    application::{error::AppError, proxy::ProxyService},
    cache::{CacheConfig, CacheEngine, KvStore, MemoryKvStore, OriginFetcher},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        origin::HttpOriginFetcher,
        telemetry,
    },
};
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(MemoryKvStore::new(&cache_config));
    let purge_handle = spawn_store_purge(store.clone(), cache_config.fresh_ttl());

    let proxy = Arc::new(build_proxy(&settings, cache_config, store)?);
    let scheduler = proxy.engine().scheduler().clone();

    let router = http::build_router(HttpState {
        proxy: proxy.clone(),
    });

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "dyncache::serve",
        addr = %settings.server.addr,
        origin = %settings.origin.base_url,
        collections = ?settings.proxy.collections,
        "Proxy listening"
    );

    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    let pending = scheduler.pending();
    if pending > 0 {
        info!(
            target = "dyncache::serve",
            pending, "Waiting for background refreshes"
        );
    }
    if !scheduler.drain(settings.server.graceful_shutdown).await {
        warn!(
            target = "dyncache::serve",
            abandoned = scheduler.pending(),
            "Graceful shutdown timed out, abandoning refreshes"
        );
    }

    purge_handle.abort();
    let _ = purge_handle.await;

    result
}

fn build_proxy(
    settings: &config::Settings,
    cache_config: CacheConfig,
    store: Arc<dyn KvStore>,
) -> Result<ProxyService, AppError> {
    let origin: Arc<dyn OriginFetcher> =
        Arc::new(HttpOriginFetcher::new(settings.origin.timeout).map_err(AppError::from)?);

    let engine = CacheEngine::new(cache_config, store, origin);
    Ok(ProxyService::new(
        engine,
        settings.origin.base_url.clone(),
        settings.proxy.collections.clone(),
    ))
}

/// Periodically drop expired keys so idle resources do not hold capacity.
fn spawn_store_purge(store: Arc<MemoryKvStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(target = "dyncache::store", purged, "Purged expired keys");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target = "dyncache::serve", "Shutdown signal received");
}
