use std::future::ready;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::batch::BatchProcessor;
use crate::chain::ResolutionChain;
use crate::handlers;
use crate::metrics::{setup_metrics_recorder, track_metrics};
use crate::providers::correios::CorreiosClient;
use crate::store::RecordStore;
use crate::stream::ProgressBroadcaster;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub chain: Arc<ResolutionChain>,
    pub correios: Option<Arc<CorreiosClient>>,
    pub broadcaster: ProgressBroadcaster,
    pub processor: BatchProcessor,
}

async fn index() -> &'static str {
    "cep-api"
}

pub fn router(state: AppState, metrics: bool) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/cep/upload/:batch_id", post(handlers::upload))
        .route("/cep/stream/:batch_id", get(handlers::stream))
        .route("/cep/:code", get(handlers::lookup))
        .route("/correios/cep/:code", get(handlers::correios_lookup))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install the recorder when the router is used as a library
    // (tests etc), a global recorder does not work well there.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
