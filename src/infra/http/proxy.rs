use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::application::{error::AppError, proxy::ProxyService};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub proxy: Arc<ProxyService>,
}

/// One cached route and one pass-through route per configured collection.
pub fn build_router(state: HttpState) -> Router {
    let mut router = Router::new().route("/_health", get(health));

    for collection in state.proxy.collections() {
        router = router
            .route(
                collection,
                get(resolve_collection).delete(invalidate_collection),
            )
            .route(&format!("{collection}{{*rest}}"), get(pass_through));
    }

    router
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn resolve_collection(State(state): State<HttpState>, uri: Uri) -> Response {
    state.proxy.resolve_collection(uri.path()).await
}

async fn invalidate_collection(State(state): State<HttpState>, uri: Uri) -> Response {
    state.proxy.invalidate_collection(uri.path()).await
}

async fn pass_through(State(state): State<HttpState>, uri: Uri) -> Response {
    state.proxy.pass_through(&uri).await
}

async fn not_found() -> Response {
    AppError::NotFound.into_response()
}
